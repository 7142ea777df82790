//! Bytecode generation.
//!
//! Expressions compile to a post-order, stack-based evaluation. Variables
//! live in segmented compile-time address spaces — globals from
//! [`GLOBAL_BASE`], parameters from [`PARAM_BASE`], locals from
//! [`LOCAL_BASE`] — and the VM remaps local bases by live call depth, which
//! keeps recursion from touching caller frames. Control flow uses symbolic
//! labels; a patch pass resolves labels and function call targets once the
//! whole stream is emitted.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use rtmc_asm::{
    BytecodeProgram, CompileMode, ConstValue, Instruction, Opcode, GLOBAL_BASE,
    LOCAL_BASE, PARAM_BASE, RECV_BLOCKING_SENTINEL, STACK_BASE_SENTINEL,
};

use crate::{
    ast::*,
    layout::{LayoutError, StructLayoutTable},
    lexer::Intrinsic,
    sema::intrinsic_by_name,
    source::Location,
};

/// Fatal code generation failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodeGenError {
    #[error("{location}: undefined variable '{name}'")]
    UndefinedVariable { name: String, location: Location },
    #[error("{location}: unknown function '{name}'")]
    UnknownFunction { name: String, location: Location },
    #[error("{location}: undefined message queue '{name}'")]
    UndefinedQueue { name: String, location: Location },
    #[error("{location}: cannot determine the struct type of '{name}'")]
    UnresolvedStruct { name: String, location: Location },
    #[error("{location}: field '{field}' is ambiguous across struct types")]
    AmbiguousField { field: String, location: Location },
    #[error("{location}: {message}")]
    Unsupported { message: String, location: Location },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("unresolved label '{0}'")]
    UnresolvedLabel(String),
}

/// Generate a program from an analyzed (and usually optimized) AST.
pub fn generate(
    ast: &Program,
    layouts: &mut StructLayoutTable,
    mode: CompileMode,
) -> Result<BytecodeProgram, CodeGenError> {
    let mut generator = Generator::new(layouts, mode);
    generator.run(ast)?;
    Ok(generator.finish())
}

#[derive(Debug)]
enum PatchTarget {
    Label(String),
    Function(String),
}

#[derive(Debug)]
struct Patch {
    instruction: usize,
    operand: usize,
    target: PatchTarget,
}

struct Generator<'a> {
    layouts: &'a mut StructLayoutTable,
    program: BytecodeProgram,
    labels: HashMap<String, u32>,
    label_counter: u32,
    patches: Vec<Patch>,
    /// Constant-pool slots to overwrite with function addresses.
    function_consts: Vec<(usize, String, Location)>,
    functions_seen: HashSet<String>,

    global_offset: u32,
    global_types: HashMap<String, String>,

    current_function: Option<String>,
    locals: IndexMap<String, u32>,
    local_types: HashMap<String, String>,
    local_offset: u32,
    frame_size: u32,

    break_labels: Vec<String>,
    continue_labels: Vec<String>,
    message_ids: IndexMap<String, u32>,

    line: u32,
    column: u32,
}

impl<'a> Generator<'a> {
    fn new(layouts: &'a mut StructLayoutTable, mode: CompileMode) -> Self {
        Self {
            layouts,
            program: BytecodeProgram {
                mode,
                ..Default::default()
            },
            labels: HashMap::new(),
            label_counter: 0,
            patches: Vec::new(),
            function_consts: Vec::new(),
            functions_seen: HashSet::new(),
            global_offset: GLOBAL_BASE,
            global_types: HashMap::new(),
            current_function: None,
            locals: IndexMap::new(),
            local_types: HashMap::new(),
            local_offset: 0,
            frame_size: 0,
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            message_ids: IndexMap::new(),
            line: 0,
            column: 0,
        }
    }

    fn run(&mut self, ast: &Program) -> Result<(), CodeGenError> {
        // Aggregates may not have passed through sema when the gate is
        // disabled; registration is idempotent.
        for decl in &ast.declarations {
            match decl {
                Decl::Struct(s) => self.layouts.register_struct(s),
                Decl::Union(u) => self.layouts.register_union(u),
                Decl::Function(f) => {
                    self.functions_seen.insert(f.name.clone());
                }
                _ => {}
            }
        }

        // Global initialization stream first; it is scanned at load time,
        // never executed as code.
        for decl in &ast.declarations {
            if !matches!(decl, Decl::Function(_)) {
                self.gen_decl(decl)?;
            }
        }

        for decl in &ast.declarations {
            if let Decl::Function(f) = decl {
                self.gen_function(f)?;
            }
        }

        self.emit(Instruction::from(Opcode::Halt));
        self.patch()?;
        self.export_layouts()?;

        tracing::debug!(
            instructions = self.program.instructions.len(),
            functions = self.program.functions.len(),
            "bytecode generated"
        );
        Ok(())
    }

    fn finish(self) -> BytecodeProgram {
        self.program
    }

    // ---- emission -------------------------------------------------------

    fn here(&self) -> u32 {
        self.program.instructions.len() as u32
    }

    fn set_pos(&mut self, location: &Location) {
        self.line = location.line;
        self.column = location.column;
    }

    fn emit(&mut self, mut instruction: Instruction) {
        if self.program.mode == CompileMode::Debug {
            instruction.line = self.line;
            instruction.column = self.column;
            self.program.debug_info.insert(self.here(), self.line);
        }
        self.program.instructions.push(instruction);
    }

    fn emit_op(&mut self, opcode: Opcode, operands: Vec<u32>) {
        self.emit(Instruction::new(opcode, operands));
    }

    fn comment(&mut self, text: &str) {
        if self.program.mode == CompileMode::Debug {
            let index = self.program.add_string(text);
            self.emit_op(Opcode::Comment, vec![index]);
        }
    }

    fn load_int(&mut self, value: i64) {
        let index = self.program.add_constant(ConstValue::Int(value));
        self.emit_op(Opcode::LoadConst, vec![index]);
    }

    fn new_label(&mut self) -> String {
        let label = format!("L{}", self.label_counter);
        self.label_counter += 1;
        label
    }

    fn mark_label(&mut self, label: &str) {
        self.labels.insert(label.to_owned(), self.here());
    }

    fn emit_jump(&mut self, opcode: Opcode, label: &str) {
        self.patches.push(Patch {
            instruction: self.program.instructions.len(),
            operand: 0,
            target: PatchTarget::Label(label.to_owned()),
        });
        self.emit_op(opcode, vec![0]);
    }

    fn patch(&mut self) -> Result<(), CodeGenError> {
        for patch in &self.patches {
            let address = match &patch.target {
                PatchTarget::Label(label) => *self
                    .labels
                    .get(label)
                    .ok_or_else(|| CodeGenError::UnresolvedLabel(label.clone()))?,
                PatchTarget::Function(name) => *self
                    .program
                    .functions
                    .get(name)
                    .ok_or_else(|| CodeGenError::UnresolvedLabel(name.clone()))?,
            };
            self.program.instructions[patch.instruction].operands[patch.operand] =
                address;
        }

        for (slot, name, location) in &self.function_consts {
            let address =
                self.program.functions.get(name).copied().ok_or_else(|| {
                    CodeGenError::UnknownFunction {
                        name: name.clone(),
                        location: location.clone(),
                    }
                })?;
            self.program.constants[*slot] = ConstValue::Int(i64::from(address));
        }

        Ok(())
    }

    fn export_layouts(&mut self) -> Result<(), CodeGenError> {
        let names: Vec<String> = self.layouts.names().cloned().collect();
        for name in names {
            let layout = self.layouts.layout(&name)?;
            let mut fields = IndexMap::new();
            for (field, info) in &layout.fields {
                fields.insert(field.clone(), info.byte_offset);
            }
            self.program.struct_layouts.insert(name, fields);
        }
        Ok(())
    }

    // ---- addresses ------------------------------------------------------

    fn size_of_type(&mut self, ty: &TypeRef) -> Result<u32, CodeGenError> {
        Ok(self.layouts.size_of_type(ty)?)
    }

    /// Storage footprint of a variable of this type, in address units.
    fn slot_size(&mut self, ty: &TypeRef) -> Result<u32, CodeGenError> {
        Ok(self.size_of_type(ty)?.max(1))
    }

    fn allocate(&mut self, name: &str, ty: &TypeRef) -> Result<u32, CodeGenError> {
        let size = self.slot_size(ty)?;
        let type_name = ty.type_name();

        if self.current_function.is_some() {
            let address = LOCAL_BASE + self.local_offset;
            self.local_offset += size;
            self.frame_size = self.frame_size.max(self.local_offset);
            self.locals.insert(name.to_owned(), address);
            self.local_types.insert(name.to_owned(), type_name);
            Ok(address)
        } else {
            let address = self.global_offset;
            self.global_offset += size;
            self.program.symbols.insert(name.to_owned(), address);
            self.global_types.insert(name.to_owned(), type_name);
            Ok(address)
        }
    }

    /// Reserve raw global storage without a named symbol (array backing).
    fn allocate_global_block(&mut self, size: u32) -> u32 {
        let address = self.global_offset;
        self.global_offset += size.max(1);
        address
    }

    fn var_address(&self, name: &str, location: &Location) -> Result<u32, CodeGenError> {
        if self.current_function.is_some() {
            if let Some(address) = self.locals.get(name) {
                return Ok(*address);
            }
        }
        self.program.symbols.get(name).copied().ok_or_else(|| {
            CodeGenError::UndefinedVariable {
                name: name.to_owned(),
                location: location.clone(),
            }
        })
    }

    fn var_type_name(&self, name: &str) -> Option<&str> {
        if self.current_function.is_some() {
            if let Some(ty) = self.local_types.get(name) {
                return Some(ty);
            }
        }
        self.global_types.get(name).map(String::as_str)
    }

    /// Size in bytes for a type known only by its tracked name.
    fn size_of_type_name(&mut self, name: &str) -> Result<u32, CodeGenError> {
        let name = name.strip_prefix("struct ").unwrap_or(name);
        if name.ends_with('*') {
            return Ok(8);
        }
        if let Some(open) = name.find('[') {
            let element = &name[..open].to_owned();
            let count: u32 = name[open + 1..name.len() - 1].parse().unwrap_or(1);
            return Ok(self.size_of_type_name(element)? * count);
        }
        Ok(match name {
            "int" | "float" => 4,
            "char" | "bool" => 1,
            "void" => 0,
            aggregate => self.layouts.size_of(aggregate)?,
        })
    }

    // ---- declarations ---------------------------------------------------

    fn gen_decl(&mut self, decl: &Decl) -> Result<(), CodeGenError> {
        match decl {
            Decl::Variable(v) => self.gen_variable(v),
            Decl::Array(a) => self.gen_array(a),
            Decl::Message(m) => self.gen_message(m),
            Decl::Struct(_) | Decl::Union(_) | Decl::Include(_) => Ok(()),
            Decl::Function(_) => Ok(()),
        }
    }

    fn gen_variable(&mut self, v: &VariableDecl) -> Result<(), CodeGenError> {
        self.set_pos(&v.location);
        let address = self.allocate(&v.name, &v.ty)?;

        let aggregate = match &v.ty {
            TypeRef::Struct(name) | TypeRef::Union(name) => Some(name.clone()),
            _ => None,
        };

        if self.current_function.is_some() {
            if let Some(name) = aggregate {
                return self.gen_field_defaults(&name, address);
            }
            match &v.initializer {
                Some(init) => self.gen_expr(init)?,
                None => self.load_int(0),
            }
            self.emit_op(Opcode::StoreVar, vec![address]);
            Ok(())
        } else {
            if let Some(name) = aggregate {
                return self.gen_global_field_defaults(&name, address);
            }
            // Globals initialize at load time from the constant pool; a
            // non-literal initializer degrades to zero.
            let value = match &v.initializer {
                Some(Expr::Literal { value, .. }) => literal_const(value, &mut self.program),
                _ => self.program.add_constant(ConstValue::Int(0)),
            };
            self.emit_op(
                Opcode::GlobalVarDeclare,
                vec![address, value, u32::from(v.is_const)],
            );
            Ok(())
        }
    }

    fn gen_field_defaults(
        &mut self,
        aggregate: &str,
        base: u32,
    ) -> Result<(), CodeGenError> {
        for (field_name, field) in self.layouts.field_defaults(aggregate) {
            let Some(default) = field.default.clone() else {
                continue;
            };
            self.gen_expr(&default)?;
            match self.layouts.bit_field_info(aggregate, &field_name) {
                Some((byte, bit, width)) => self.emit_op(
                    Opcode::StoreStructMemberBit,
                    vec![base, byte, bit, width],
                ),
                None => {
                    let offset = self.layouts.field_offset(aggregate, &field_name)?;
                    self.emit_op(Opcode::StoreStructMember, vec![base, offset]);
                }
            }
        }
        Ok(())
    }

    fn gen_global_field_defaults(
        &mut self,
        aggregate: &str,
        base: u32,
    ) -> Result<(), CodeGenError> {
        // Load-time init can only come from the constant pool, so only
        // literal defaults of regular fields survive at global scope.
        for (field_name, field) in self.layouts.field_defaults(aggregate) {
            let Some(Expr::Literal { value, .. }) = field.default else {
                continue;
            };
            if self.layouts.bit_field_info(aggregate, &field_name).is_some() {
                continue;
            }
            let offset = self.layouts.field_offset(aggregate, &field_name)?;
            let slot = literal_const(&value, &mut self.program);
            self.emit_op(Opcode::GlobalVarDeclare, vec![base + offset, slot, 0]);
        }
        Ok(())
    }

    fn gen_array(&mut self, a: &ArrayDecl) -> Result<(), CodeGenError> {
        self.set_pos(&a.location);
        let element_size = self.size_of_type(&a.element_type)?.max(1);
        let count = match a.size.as_ref() {
            Expr::Literal { value: LiteralValue::Int(n), .. } => *n as u32,
            other => {
                return Err(CodeGenError::Unsupported {
                    message: "array size must be a compile-time constant".into(),
                    location: other.location().clone(),
                })
            }
        };

        let pointer_ty = TypeRef::Pointer {
            base: Box::new(a.element_type.clone()),
            level: 1,
        };

        if self.current_function.is_some() {
            let address = self.allocate(&a.name, &pointer_ty)?;
            self.local_types
                .insert(a.name.clone(), format!("{}[{count}]", a.element_type.type_name()));

            self.emit_op(Opcode::AllocArray, vec![element_size, count]);
            self.emit_op(Opcode::StoreVar, vec![address]);

            if let Some(Expr::ArrayLiteral { elements, .. }) = &a.initializer {
                for (i, element) in elements.iter().enumerate().take(count as usize) {
                    self.emit_op(Opcode::LoadVar, vec![address]);
                    self.load_int(i as i64);
                    self.gen_expr(element)?;
                    self.emit_op(Opcode::StoreArrayElem, vec![element_size]);
                }
            }
            Ok(())
        } else {
            // Global arrays back onto reserved global cells; the named
            // symbol holds the base pointer.
            let address = self.allocate(&a.name, &pointer_ty)?;
            self.global_types
                .insert(a.name.clone(), format!("{}[{count}]", a.element_type.type_name()));
            let storage = self.allocate_global_block(element_size * count);

            let base_slot = self
                .program
                .add_constant(ConstValue::Int(i64::from(storage)));
            self.emit_op(Opcode::GlobalVarDeclare, vec![address, base_slot, 0]);

            if let Some(Expr::ArrayLiteral { elements, .. }) = &a.initializer {
                for (i, element) in elements.iter().enumerate().take(count as usize) {
                    if let Expr::Literal { value, .. } = element {
                        let slot = literal_const(value, &mut self.program);
                        self.emit_op(
                            Opcode::GlobalVarDeclare,
                            vec![storage + i as u32 * element_size, slot, 0],
                        );
                    }
                }
            }
            Ok(())
        }
    }

    fn gen_message(&mut self, m: &MessageDecl) -> Result<(), CodeGenError> {
        self.set_pos(&m.location);
        let id = self.message_ids.len() as u32;
        self.message_ids.insert(m.name.clone(), id);
        self.program.symbols.insert(m.name.clone(), id);

        let type_index = self.program.add_string(&m.element_type.type_name());
        self.emit_op(Opcode::MsgDeclare, vec![id, type_index]);
        Ok(())
    }

    fn gen_function(&mut self, f: &FunctionDecl) -> Result<(), CodeGenError> {
        self.set_pos(&f.location);
        self.program.functions.insert(f.name.clone(), self.here());

        self.current_function = Some(f.name.clone());
        self.locals.clear();
        self.local_types.clear();
        self.local_offset = 0;
        self.frame_size = 0;

        for (i, param) in f.params.iter().enumerate() {
            let address = PARAM_BASE + i as u32;
            self.locals.insert(param.name.clone(), address);
            self.local_types
                .insert(param.name.clone(), param.ty.type_name());
        }

        self.comment(&format!("Function {} prologue", f.name));
        self.gen_block(&f.body)?;
        self.comment(&format!(
            "Function {} epilogue - frame size: {}",
            f.name, self.frame_size
        ));

        if self.frame_size > 0 {
            let size = self.frame_size;
            self.emit_op(Opcode::FreeFrame, vec![size]);
        }
        self.emit(Instruction::from(Opcode::Ret));

        self.current_function = None;
        Ok(())
    }

    // ---- statements -----------------------------------------------------

    fn gen_block(&mut self, block: &Block) -> Result<(), CodeGenError> {
        // Shadowed names must resolve to the inner slot only inside the
        // block; addresses grow monotonically across the whole frame.
        let saved_locals = self.locals.clone();
        let saved_types = self.local_types.clone();

        for stmt in &block.statements {
            self.gen_stmt(stmt)?;
        }

        self.locals = saved_locals;
        self.local_types = saved_types;
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        match stmt {
            Stmt::Block(block) => self.gen_block(block),
            Stmt::Expr(expr) => {
                self.set_pos(expr.location());
                self.gen_expr(expr)
            }
            Stmt::Declaration(decl) => self.gen_decl(decl),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                location,
            } => {
                self.set_pos(location);
                let else_label = self.new_label();
                let end_label = self.new_label();

                self.gen_expr(condition)?;
                self.emit_jump(Opcode::JumpifFalse, &else_label);
                self.gen_stmt(then_branch)?;
                self.emit_jump(Opcode::Jump, &end_label);
                self.mark_label(&else_label);
                if let Some(else_branch) = else_branch {
                    self.gen_stmt(else_branch)?;
                }
                self.mark_label(&end_label);
                Ok(())
            }
            Stmt::While {
                condition,
                body,
                location,
            } => {
                self.set_pos(location);
                let start = self.new_label();
                let end = self.new_label();

                self.break_labels.push(end.clone());
                self.continue_labels.push(start.clone());

                self.mark_label(&start);
                self.gen_expr(condition)?;
                self.emit_jump(Opcode::JumpifFalse, &end);
                self.gen_stmt(body)?;
                self.emit_jump(Opcode::Jump, &start);
                self.mark_label(&end);

                self.break_labels.pop();
                self.continue_labels.pop();
                Ok(())
            }
            Stmt::For {
                init,
                condition,
                update,
                body,
                location,
            } => {
                self.set_pos(location);
                let start = self.new_label();
                let continue_label = self.new_label();
                let end = self.new_label();

                self.break_labels.push(end.clone());
                self.continue_labels.push(continue_label.clone());

                if let Some(init) = init {
                    self.gen_stmt(init)?;
                }
                self.mark_label(&start);
                if let Some(condition) = condition {
                    self.gen_expr(condition)?;
                    self.emit_jump(Opcode::JumpifFalse, &end);
                }
                self.gen_stmt(body)?;
                self.mark_label(&continue_label);
                if let Some(update) = update {
                    self.gen_expr(update)?;
                }
                self.emit_jump(Opcode::Jump, &start);
                self.mark_label(&end);

                self.break_labels.pop();
                self.continue_labels.pop();
                Ok(())
            }
            Stmt::Return { value, location } => {
                self.set_pos(location);
                if let Some(value) = value {
                    self.gen_expr(value)?;
                }
                // Locals allocated up to this point are the frame's live
                // set; early returns free them too.
                if self.local_offset > 0 {
                    let size = self.local_offset;
                    self.emit_op(Opcode::FreeFrame, vec![size]);
                }
                self.emit(Instruction::from(Opcode::Ret));
                Ok(())
            }
            Stmt::Break { location } => {
                self.set_pos(location);
                let Some(label) = self.break_labels.last().cloned() else {
                    return Err(CodeGenError::Unsupported {
                        message: "break outside of a loop".into(),
                        location: location.clone(),
                    });
                };
                self.emit_jump(Opcode::Jump, &label);
                Ok(())
            }
            Stmt::Continue { location } => {
                self.set_pos(location);
                let Some(label) = self.continue_labels.last().cloned() else {
                    return Err(CodeGenError::Unsupported {
                        message: "continue outside of a loop".into(),
                        location: location.clone(),
                    });
                };
                self.emit_jump(Opcode::Jump, &label);
                Ok(())
            }
        }
    }

    // ---- expressions ----------------------------------------------------

    fn gen_expr(&mut self, expr: &Expr) -> Result<(), CodeGenError> {
        match expr {
            Expr::Literal { value, .. } => {
                let slot = literal_const(value, &mut self.program);
                self.emit_op(Opcode::LoadConst, vec![slot]);
                Ok(())
            }
            Expr::Identifier { name, location } => {
                if self.functions_seen.contains(name) {
                    // Function reference: a pool slot patched with the final
                    // address once every function is placed. The string
                    // marker keeps integer interning away from the slot
                    // until it holds the real address.
                    let slot = self
                        .program
                        .add_constant(ConstValue::Str(format!("fn:{name}")))
                        as usize;
                    self.function_consts
                        .push((slot, name.clone(), location.clone()));
                    self.emit_op(Opcode::LoadConst, vec![slot as u32]);
                    return Ok(());
                }
                let address = self.var_address(name, location)?;
                self.emit_op(Opcode::LoadVar, vec![address]);
                Ok(())
            }
            Expr::Binary {
                op,
                left,
                right,
                location,
            } => self.gen_binary(*op, left, right, location),
            Expr::Unary {
                op,
                operand,
                location,
            } => self.gen_unary(*op, operand, location),
            Expr::Postfix {
                op,
                operand,
                location,
            } => self.gen_postfix(*op, operand, location),
            Expr::Assignment {
                op,
                target,
                value,
                location,
            } => self.gen_assignment(*op, target, value, location),
            Expr::Call {
                callee,
                arguments,
                location,
            } => self.gen_call(callee, arguments, location),
            Expr::Member { .. } => {
                let place = self.resolve_member(expr)?;
                self.gen_member_load(&place)
            }
            Expr::ArrayAccess {
                array,
                index,
                location,
            } => {
                let element_size = self.gen_array_base(array, location)?;
                self.gen_expr(index)?;
                self.emit_op(Opcode::LoadArrayElem, vec![element_size]);
                Ok(())
            }
            Expr::ArrayLiteral { elements, .. } => {
                // Array literals only carry meaning in declarations; as a
                // bare expression the first element stands in.
                match elements.first() {
                    Some(first) => self.gen_expr(first),
                    None => {
                        self.load_int(0);
                        Ok(())
                    }
                }
            }
            Expr::AddressOf { operand, location } => match operand.as_ref() {
                Expr::Identifier { name, location } => {
                    let address = self.var_address(name, location)?;
                    self.emit_op(Opcode::LoadAddr, vec![address]);
                    Ok(())
                }
                _ => Err(CodeGenError::Unsupported {
                    message: "can only take the address of a variable".into(),
                    location: location.clone(),
                }),
            },
            Expr::Dereference { operand, .. } => {
                self.gen_expr(operand)?;
                self.emit(Instruction::from(Opcode::LoadDeref));
                Ok(())
            }
            Expr::Cast { operand, .. } => {
                // Representation is shared between int and float cells; the
                // ALU promotes as needed, so casts cost nothing here.
                self.gen_expr(operand)
            }
            Expr::SizeOf { target, location } => {
                let size = self.sizeof_value(target, location)?;
                self.load_int(i64::from(size));
                Ok(())
            }
            Expr::MessageSend {
                queue,
                payload,
                location,
            } => {
                self.gen_expr(payload)?;
                let id = self.queue_id(queue, location)?;
                self.emit_op(Opcode::MsgSend, vec![id]);
                Ok(())
            }
            Expr::MessageRecv {
                queue,
                timeout,
                location,
            } => {
                match timeout {
                    Some(timeout) => self.gen_expr(timeout)?,
                    None => self.load_int(RECV_BLOCKING_SENTINEL),
                }
                let id = self.queue_id(queue, location)?;
                self.emit_op(Opcode::MsgRecv, vec![id]);
                Ok(())
            }
        }
    }

    fn queue_id(&self, queue: &str, location: &Location) -> Result<u32, CodeGenError> {
        self.message_ids.get(queue).copied().ok_or_else(|| {
            CodeGenError::UndefinedQueue {
                name: queue.to_owned(),
                location: location.clone(),
            }
        })
    }

    fn sizeof_value(
        &mut self,
        target: &SizeOfTarget,
        location: &Location,
    ) -> Result<u32, CodeGenError> {
        match target {
            SizeOfTarget::Type(ty) => self.size_of_type(ty),
            SizeOfTarget::Expr(inner) => match inner.as_ref() {
                Expr::Identifier { name, .. } => {
                    let Some(type_name) = self.var_type_name(name).map(str::to_owned)
                    else {
                        return Err(CodeGenError::UndefinedVariable {
                            name: name.clone(),
                            location: location.clone(),
                        });
                    };
                    self.size_of_type_name(&type_name)
                }
                Expr::Literal { value, .. } => Ok(match value {
                    LiteralValue::Int(_) | LiteralValue::Float(_) => 4,
                    LiteralValue::Char(_) | LiteralValue::Bool(_) => 1,
                    LiteralValue::Str(s) => s.len() as u32 + 1,
                }),
                other => Err(CodeGenError::Unsupported {
                    message: "sizeof of this expression is not supported".into(),
                    location: other.location().clone(),
                }),
            },
        }
    }

    fn gen_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        location: &Location,
    ) -> Result<(), CodeGenError> {
        use BinaryOp::*;

        // Logical operators normalize both sides to 0/1 so the bitwise
        // AND/OR opcodes compute the logical result.
        if op.is_logical() {
            self.gen_expr(left)?;
            self.load_int(0);
            self.emit(Instruction::from(Opcode::Neq));
            self.gen_expr(right)?;
            self.load_int(0);
            self.emit(Instruction::from(Opcode::Neq));
            self.emit(Instruction::from(if op == LogicalAnd {
                Opcode::And
            } else {
                Opcode::Or
            }));
            return Ok(());
        }

        // The ISA has no shift opcodes; constant shift counts lower to
        // multiplication or division by a power of two.
        if matches!(op, Shl | Shr) {
            let Expr::Literal { value: LiteralValue::Int(count), .. } = right else {
                return Err(CodeGenError::Unsupported {
                    message: "shift count must be a compile-time constant".into(),
                    location: location.clone(),
                });
            };
            let factor = 1i64 << (*count as u32 % 32);
            self.gen_expr(left)?;
            self.load_int(factor);
            self.emit(Instruction::from(if op == Shl {
                Opcode::Mul
            } else {
                Opcode::Div
            }));
            return Ok(());
        }

        self.gen_expr(left)?;
        self.gen_expr(right)?;
        let opcode = match op {
            Add => Opcode::Add,
            Sub => Opcode::Sub,
            Mul => Opcode::Mul,
            Div => Opcode::Div,
            Mod => Opcode::Mod,
            Eq => Opcode::Eq,
            Neq => Opcode::Neq,
            Lt => Opcode::Lt,
            Lte => Opcode::Lte,
            Gt => Opcode::Gt,
            Gte => Opcode::Gte,
            BitAnd => Opcode::And,
            BitOr => Opcode::Or,
            BitXor => Opcode::Xor,
            LogicalAnd | LogicalOr | Shl | Shr => unreachable!("handled above"),
        };
        self.emit(Instruction::from(opcode));
        Ok(())
    }

    fn gen_unary(
        &mut self,
        op: UnaryOp,
        operand: &Expr,
        location: &Location,
    ) -> Result<(), CodeGenError> {
        match op {
            UnaryOp::Plus => self.gen_expr(operand),
            UnaryOp::Neg => {
                self.gen_expr(operand)?;
                self.load_int(-1);
                self.emit(Instruction::from(Opcode::Mul));
                Ok(())
            }
            UnaryOp::LogicalNot => {
                self.gen_expr(operand)?;
                self.emit(Instruction::from(Opcode::Not));
                Ok(())
            }
            UnaryOp::BitNot => {
                self.gen_expr(operand)?;
                self.load_int(0xFFFF_FFFF);
                self.emit(Instruction::from(Opcode::Xor));
                Ok(())
            }
            UnaryOp::PreIncrement | UnaryOp::PreDecrement => {
                let Expr::Identifier { name, location } = operand else {
                    return Err(CodeGenError::Unsupported {
                        message: "++/-- is only supported on variables".into(),
                        location: location.clone(),
                    });
                };
                let address = self.var_address(name, location)?;
                self.emit_op(Opcode::LoadVar, vec![address]);
                self.load_int(1);
                self.emit(Instruction::from(if op == UnaryOp::PreIncrement {
                    Opcode::Add
                } else {
                    Opcode::Sub
                }));
                self.emit_op(Opcode::StoreVar, vec![address]);
                // The expression value is the updated variable.
                self.emit_op(Opcode::LoadVar, vec![address]);
                Ok(())
            }
        }
    }

    fn gen_postfix(
        &mut self,
        op: PostfixOp,
        operand: &Expr,
        location: &Location,
    ) -> Result<(), CodeGenError> {
        let Expr::Identifier { name, location } = operand else {
            return Err(CodeGenError::Unsupported {
                message: "++/-- is only supported on variables".into(),
                location: location.clone(),
            });
        };
        let address = self.var_address(name, location)?;

        // Original value first; it is the expression's result.
        self.emit_op(Opcode::LoadVar, vec![address]);
        self.emit_op(Opcode::LoadVar, vec![address]);
        self.load_int(1);
        self.emit(Instruction::from(if op == PostfixOp::Increment {
            Opcode::Add
        } else {
            Opcode::Sub
        }));
        self.emit_op(Opcode::StoreVar, vec![address]);
        Ok(())
    }

    fn gen_assignment(
        &mut self,
        op: AssignOp,
        target: &Expr,
        value: &Expr,
        location: &Location,
    ) -> Result<(), CodeGenError> {
        match target {
            Expr::Identifier { name, location } => {
                let address = self.var_address(name, location)?;
                if let Some(binary) = op.binary_op() {
                    self.emit_op(Opcode::LoadVar, vec![address]);
                    self.gen_expr(value)?;
                    self.emit(Instruction::from(binary_opcode(binary)));
                } else {
                    self.gen_expr(value)?;
                }
                self.emit_op(Opcode::StoreVar, vec![address]);
                Ok(())
            }
            Expr::Member { .. } => {
                let place = self.resolve_member(target)?;
                let Some(binary) = op.binary_op() else {
                    return self.gen_member_store(&place, value);
                };
                match place {
                    MemberPlace::Direct { .. } => {
                        self.gen_member_load(&place)?;
                        self.gen_expr(value)?;
                        self.emit(Instruction::from(binary_opcode(binary)));
                        self.gen_member_store_top(&place)
                    }
                    MemberPlace::Indirect { pointer, offset, bit } => {
                        // Target address twice: once for the store, once
                        // for the read of the current value.
                        for _ in 0..2 {
                            self.gen_expr(&pointer)?;
                            if offset > 0 {
                                self.load_int(i64::from(offset));
                                self.emit(Instruction::from(Opcode::Add));
                            }
                        }
                        match bit {
                            Some((bit_offset, width)) => self.emit_op(
                                Opcode::LoadStructMemberBit,
                                vec![STACK_BASE_SENTINEL, 0, bit_offset, width],
                            ),
                            None => self.emit(Instruction::from(Opcode::LoadDeref)),
                        }
                        self.gen_expr(value)?;
                        self.emit(Instruction::from(binary_opcode(binary)));
                        match bit {
                            Some((bit_offset, width)) => self.emit_op(
                                Opcode::StoreStructMemberBit,
                                vec![STACK_BASE_SENTINEL, 0, bit_offset, width],
                            ),
                            None => self.emit(Instruction::from(Opcode::StoreDeref)),
                        }
                        Ok(())
                    }
                }
            }
            Expr::ArrayAccess {
                array,
                index,
                location: target_location,
            } => {
                let element_size = self.gen_array_base(array, target_location)?;
                self.gen_expr(index)?;
                if let Some(binary) = op.binary_op() {
                    // Base and index again for the read side.
                    self.gen_array_base(array, target_location)?;
                    self.gen_expr(index)?;
                    self.emit_op(Opcode::LoadArrayElem, vec![element_size]);
                    self.gen_expr(value)?;
                    self.emit(Instruction::from(binary_opcode(binary)));
                } else {
                    self.gen_expr(value)?;
                }
                self.emit_op(Opcode::StoreArrayElem, vec![element_size]);
                Ok(())
            }
            Expr::Dereference { operand, .. } => {
                self.gen_expr(operand)?;
                if let Some(binary) = op.binary_op() {
                    self.gen_expr(operand)?;
                    self.emit(Instruction::from(Opcode::LoadDeref));
                    self.gen_expr(value)?;
                    self.emit(Instruction::from(binary_opcode(binary)));
                } else {
                    self.gen_expr(value)?;
                }
                self.emit(Instruction::from(Opcode::StoreDeref));
                Ok(())
            }
            other => Err(CodeGenError::Unsupported {
                message: "unsupported assignment target".into(),
                location: other.location().clone(),
            }),
        }
    }

    // ---- calls ----------------------------------------------------------

    fn gen_call(
        &mut self,
        callee: &str,
        arguments: &[Expr],
        location: &Location,
    ) -> Result<(), CodeGenError> {
        if let Some(intrinsic) = intrinsic_by_name(callee) {
            return self.gen_intrinsic(intrinsic, arguments, location);
        }

        if !self.functions_seen.contains(callee) {
            return Err(CodeGenError::UnknownFunction {
                name: callee.to_owned(),
                location: location.clone(),
            });
        }

        for argument in arguments {
            self.gen_expr(argument)?;
        }
        self.patches.push(Patch {
            instruction: self.program.instructions.len(),
            operand: 0,
            target: PatchTarget::Function(callee.to_owned()),
        });
        self.emit_op(Opcode::Call, vec![0, arguments.len() as u32]);
        Ok(())
    }

    fn gen_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        arguments: &[Expr],
        location: &Location,
    ) -> Result<(), CodeGenError> {
        use Intrinsic::*;

        match intrinsic {
            StartTask => {
                if arguments.len() != 5 {
                    return Err(CodeGenError::Unsupported {
                        message:
                            "StartTask requires (stack_size, core, priority, task_id, function)"
                                .into(),
                        location: location.clone(),
                    });
                }
                for argument in arguments {
                    self.gen_expr(argument)?;
                }
                self.emit(Instruction::from(Opcode::RtosCreateTask));
                Ok(())
            }
            RtosCreateTask => {
                if arguments.len() != 5 {
                    return Err(CodeGenError::Unsupported {
                        message:
                            "RTOS_CREATE_TASK requires (function, name, stack_size, priority, core)"
                                .into(),
                        location: location.clone(),
                    });
                }
                // Reorder to the push sequence the VM unwinds: stack size,
                // core, priority, task name, function address.
                for index in [2usize, 4, 3, 1, 0] {
                    self.gen_expr(&arguments[index])?;
                }
                self.emit(Instruction::from(Opcode::RtosCreateTask));
                Ok(())
            }
            Print | DbgPrint => {
                for argument in arguments {
                    self.gen_expr(argument)?;
                }
                self.emit(Instruction::from(Opcode::DbgPrint));
                Ok(())
            }
            Printf => {
                for argument in arguments {
                    self.gen_expr(argument)?;
                }
                let value_count = arguments.len().saturating_sub(1) as u32;
                self.emit_op(Opcode::DbgPrintf, vec![0, value_count]);
                Ok(())
            }
            other => {
                for argument in arguments {
                    self.gen_expr(argument)?;
                }
                self.emit(Instruction::from(intrinsic_opcode(other)));
                Ok(())
            }
        }
    }

    // ---- struct member access -------------------------------------------

    fn gen_member_load(&mut self, place: &MemberPlace) -> Result<(), CodeGenError> {
        match place {
            MemberPlace::Direct { base, offset, bit } => match bit {
                Some((bit_offset, width)) => {
                    self.emit_op(
                        Opcode::LoadStructMemberBit,
                        vec![*base, *offset, *bit_offset, *width],
                    );
                    Ok(())
                }
                None => {
                    self.emit_op(Opcode::LoadStructMember, vec![*base, *offset]);
                    Ok(())
                }
            },
            MemberPlace::Indirect { pointer, offset, bit } => {
                self.gen_expr(pointer)?;
                if *offset > 0 {
                    self.load_int(i64::from(*offset));
                    self.emit(Instruction::from(Opcode::Add));
                }
                match bit {
                    Some((bit_offset, width)) => self.emit_op(
                        Opcode::LoadStructMemberBit,
                        vec![STACK_BASE_SENTINEL, 0, *bit_offset, *width],
                    ),
                    None => self.emit(Instruction::from(Opcode::LoadDeref)),
                }
                Ok(())
            }
        }
    }

    /// Store the value the caller just left on the stack.
    fn gen_member_store_top(&mut self, place: &MemberPlace) -> Result<(), CodeGenError> {
        match place {
            MemberPlace::Direct { base, offset, bit } => {
                match bit {
                    Some((bit_offset, width)) => self.emit_op(
                        Opcode::StoreStructMemberBit,
                        vec![*base, *offset, *bit_offset, *width],
                    ),
                    None => self.emit_op(Opcode::StoreStructMember, vec![*base, *offset]),
                }
                Ok(())
            }
            MemberPlace::Indirect { .. } => Err(CodeGenError::Unsupported {
                message: "compound assignment through a pointer member needs a simple value"
                    .into(),
                location: Location::unknown(),
            }),
        }
    }

    fn gen_member_store(
        &mut self,
        place: &MemberPlace,
        value: &Expr,
    ) -> Result<(), CodeGenError> {
        match place {
            MemberPlace::Direct { .. } => {
                self.gen_expr(value)?;
                self.gen_member_store_top(place)
            }
            MemberPlace::Indirect { pointer, offset, bit } => {
                self.gen_expr(pointer)?;
                if *offset > 0 {
                    self.load_int(i64::from(*offset));
                    self.emit(Instruction::from(Opcode::Add));
                }
                self.gen_expr(value)?;
                match bit {
                    Some((bit_offset, width)) => self.emit_op(
                        Opcode::StoreStructMemberBit,
                        vec![STACK_BASE_SENTINEL, 0, *bit_offset, *width],
                    ),
                    None => self.emit(Instruction::from(Opcode::StoreDeref)),
                }
                Ok(())
            }
        }
    }

    /// Push the base pointer of an indexable expression and return the
    /// element size.
    fn gen_array_base(
        &mut self,
        array: &Expr,
        location: &Location,
    ) -> Result<u32, CodeGenError> {
        match array {
            Expr::Identifier { name, location } => {
                let address = self.var_address(name, location)?;
                let element_size = match self.var_type_name(name).map(str::to_owned) {
                    Some(type_name) => self.element_size_of(&type_name)?,
                    None => 4,
                };
                self.emit_op(Opcode::LoadVar, vec![address]);
                Ok(element_size)
            }
            Expr::Member { .. } => {
                // Array-typed field: push the field's address.
                let place = self.resolve_member_with_type(array)?;
                let element_size = match &place.1 {
                    TypeRef::Array { element, .. } => {
                        let element = element.as_ref().clone();
                        self.size_of_type(&element)?.max(1)
                    }
                    TypeRef::Pointer { base, .. } => {
                        let base = base.as_ref().clone();
                        self.size_of_type(&base)?.max(1)
                    }
                    _ => 4,
                };
                match &place.0 {
                    MemberPlace::Direct { base, offset, .. } => {
                        self.emit_op(Opcode::LoadAddr, vec![*base]);
                        if *offset > 0 {
                            self.load_int(i64::from(*offset));
                            self.emit(Instruction::from(Opcode::Add));
                        }
                    }
                    MemberPlace::Indirect { pointer, offset, .. } => {
                        let pointer = pointer.clone();
                        self.gen_expr(&pointer)?;
                        if *offset > 0 {
                            self.load_int(i64::from(*offset));
                            self.emit(Instruction::from(Opcode::Add));
                        }
                    }
                }
                Ok(element_size)
            }
            other => {
                self.gen_expr(other)?;
                let _ = location;
                Ok(4)
            }
        }
    }

    fn element_size_of(&mut self, type_name: &str) -> Result<u32, CodeGenError> {
        let element = if let Some(open) = type_name.find('[') {
            type_name[..open].to_owned()
        } else if let Some(stripped) = type_name.strip_suffix('*') {
            stripped.to_owned()
        } else {
            return Ok(4);
        };
        Ok(self.size_of_type_name(element.trim())?.max(1))
    }

    fn resolve_member(&mut self, expr: &Expr) -> Result<MemberPlace, CodeGenError> {
        Ok(self.resolve_member_with_type(expr)?.0)
    }

    /// Resolve a member chain to a place plus the final field's type.
    ///
    /// `a.b.c` accumulates `offset(b) + offset(c)` against `a`'s address;
    /// `p->f` resolves against the pointed-to struct with the pointer value
    /// computed at runtime.
    fn resolve_member_with_type(
        &mut self,
        expr: &Expr,
    ) -> Result<(MemberPlace, TypeRef), CodeGenError> {
        // Flatten the chain: innermost object first.
        let mut fields: Vec<(&str, bool, &Location)> = Vec::new();
        let mut cursor = expr;
        while let Expr::Member {
            object,
            field,
            via_pointer,
            location,
        } = cursor
        {
            fields.push((field.as_str(), *via_pointer, location));
            cursor = object;
        }
        fields.reverse();

        let Expr::Identifier { name: base_name, location: base_location } = cursor
        else {
            return Err(CodeGenError::Unsupported {
                message: "member access requires a named base".into(),
                location: cursor.location().clone(),
            });
        };

        let (first_field, first_via_pointer, first_location) = fields[0];
        for (_, via_pointer, location) in &fields[1..] {
            if *via_pointer {
                return Err(CodeGenError::Unsupported {
                    message: "'->' is only supported on the base object".into(),
                    location: (*location).clone(),
                });
            }
        }

        let mut aggregate =
            self.struct_name_of(base_name, first_field, first_via_pointer, first_location)?;

        let mut offset = 0u32;
        let mut bit = None;
        let mut final_type = TypeRef::Primitive(Primitive::Int);

        for (index, (field, _, location)) in fields.iter().enumerate() {
            let is_last = index == fields.len() - 1;

            let field_type = self
                .layouts
                .field_type_ref(&aggregate, field)
                .ok_or_else(|| CodeGenError::UnresolvedStruct {
                    name: format!("{aggregate}.{field}"),
                    location: (*location).clone(),
                })?;

            if is_last {
                if let Some((byte, bit_offset, width)) =
                    self.layouts.bit_field_info(&aggregate, field)
                {
                    offset += byte;
                    bit = Some((bit_offset, width));
                } else {
                    offset += self.layouts.field_offset(&aggregate, field)?;
                }
                final_type = field_type;
            } else {
                offset += self.layouts.field_offset(&aggregate, field)?;
                aggregate = match &field_type {
                    TypeRef::Struct(name) | TypeRef::Union(name) => name.clone(),
                    other => {
                        return Err(CodeGenError::UnresolvedStruct {
                            name: other.type_name(),
                            location: (*location).clone(),
                        })
                    }
                };
            }
        }

        let place = if first_via_pointer {
            MemberPlace::Indirect {
                pointer: Expr::Identifier {
                    name: base_name.clone(),
                    location: base_location.clone(),
                },
                offset,
                bit,
            }
        } else {
            let base = self.var_address(base_name, base_location)?;
            MemberPlace::Direct { base, offset, bit }
        };

        Ok((place, final_type))
    }

    /// Resolve the aggregate type name a member access goes through.
    fn struct_name_of(
        &mut self,
        variable: &str,
        field: &str,
        via_pointer: bool,
        location: &Location,
    ) -> Result<String, CodeGenError> {
        if let Some(type_name) = self.var_type_name(variable) {
            let mut name = type_name.strip_prefix("struct ").unwrap_or(type_name);
            if via_pointer {
                name = name.strip_suffix('*').unwrap_or(name);
            }
            let name = name.trim().to_owned();
            if self.layouts.is_known(&name) {
                return Ok(name);
            }
        }

        // Unknown variable type: a unique owner of the field decides.
        match self.layouts.sole_owner_of_field(field) {
            Some(owner) => Ok(owner.to_owned()),
            None => {
                let names: Vec<String> = self.layouts.names().cloned().collect();
                if names
                    .iter()
                    .any(|n| self.layouts.field_type_ref(n, field).is_some())
                {
                    Err(CodeGenError::AmbiguousField {
                        field: field.to_owned(),
                        location: location.clone(),
                    })
                } else {
                    Err(CodeGenError::UnresolvedStruct {
                        name: variable.to_owned(),
                        location: location.clone(),
                    })
                }
            }
        }
    }
}

/// Where a struct member lives.
enum MemberPlace {
    /// Fixed base address known at compile time.
    Direct {
        base: u32,
        offset: u32,
        bit: Option<(u32, u32)>,
    },
    /// Base pointer computed at runtime from this expression.
    Indirect {
        pointer: Expr,
        offset: u32,
        bit: Option<(u32, u32)>,
    },
}

fn literal_const(value: &LiteralValue, program: &mut BytecodeProgram) -> u32 {
    match value {
        LiteralValue::Int(v) => program.add_constant(ConstValue::Int(*v)),
        LiteralValue::Float(v) => program.add_constant(ConstValue::Float(*v)),
        LiteralValue::Char(c) => program.add_constant(ConstValue::Int(i64::from(*c as u32))),
        LiteralValue::Bool(b) => program.add_constant(ConstValue::Int(i64::from(*b))),
        LiteralValue::Str(s) => {
            let index = program.add_string(s);
            program.add_constant(ConstValue::Int(i64::from(index)))
        }
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        _ => Opcode::Mod,
    }
}

fn intrinsic_opcode(intrinsic: Intrinsic) -> Opcode {
    use Intrinsic::*;
    match intrinsic {
        RtosCreateTask | StartTask => Opcode::RtosCreateTask,
        RtosDeleteTask => Opcode::RtosDeleteTask,
        RtosDelayMs => Opcode::RtosDelayMs,
        RtosSemaphoreCreate => Opcode::RtosSemaphoreCreate,
        RtosSemaphoreTake => Opcode::RtosSemaphoreTake,
        RtosSemaphoreGive => Opcode::RtosSemaphoreGive,
        RtosYield => Opcode::RtosYield,
        RtosSuspendTask => Opcode::RtosSuspendTask,
        RtosResumeTask => Opcode::RtosResumeTask,
        HwGpioInit => Opcode::HwGpioInit,
        HwGpioSet => Opcode::HwGpioSet,
        HwGpioGet => Opcode::HwGpioGet,
        HwTimerInit => Opcode::HwTimerInit,
        HwTimerStart => Opcode::HwTimerStart,
        HwTimerStop => Opcode::HwTimerStop,
        HwTimerSetPwmDuty => Opcode::HwTimerSetPwmDuty,
        HwAdcInit => Opcode::HwAdcInit,
        HwAdcRead => Opcode::HwAdcRead,
        HwUartWrite => Opcode::HwUartWrite,
        HwSpiTransfer => Opcode::HwSpiTransfer,
        HwI2cWrite => Opcode::HwI2cWrite,
        HwI2cRead => Opcode::HwI2cRead,
        DbgPrint | Print => Opcode::DbgPrint,
        Printf => Opcode::DbgPrintf,
        DbgBreakpoint => Opcode::DbgBreakpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer::Lexer, parser::Parser as AstParser};

    fn compile(source: &str) -> BytecodeProgram {
        let tokens = Lexer::new(source, "test.rtmc").tokenize().expect("lexes");
        let ast = AstParser::new(tokens).parse().expect("parses");
        let mut layouts = StructLayoutTable::new();
        generate(&ast, &mut layouts, CompileMode::Release).expect("generates")
    }

    fn opcodes(program: &BytecodeProgram) -> Vec<Opcode> {
        program.instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn arithmetic_is_post_order() {
        let program = compile("void main() { int x = 1 + 2 * 3; }");
        let ops = opcodes(&program);
        let expr = &ops[..ops.len() - 3];
        assert_eq!(
            expr,
            [
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::Mul,
                Opcode::Add,
            ]
        );
    }

    #[test]
    fn functions_get_addresses_and_epilogues() {
        let program = compile("int f() { return 7; } void main() { int x = f(); }");
        assert!(program.functions.contains_key("f"));
        assert!(program.functions.contains_key("main"));
        assert_eq!(program.instructions.last().unwrap().opcode, Opcode::Halt);
    }

    #[test]
    fn forward_calls_are_patched() {
        let program = compile("void main() { later(); } void later() { }");
        let call = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::Call)
            .expect("call emitted");
        assert_eq!(call.operands[0], program.functions["later"]);
    }

    #[test]
    fn globals_emit_load_time_declarations() {
        let program = compile("int counter = 9; void main() { }");
        let decl = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::GlobalVarDeclare)
            .expect("global declare");
        assert_eq!(decl.operands[0], 0);
        assert_eq!(program.constants[decl.operands[1] as usize], ConstValue::Int(9));
        assert_eq!(program.symbols["counter"], 0);
    }

    #[test]
    fn locals_use_the_local_segment() {
        let program = compile("void main() { int x = 1; x = 2; }");
        let store = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::StoreVar)
            .expect("store");
        assert!(store.operands[0] >= LOCAL_BASE);
    }

    #[test]
    fn parameters_use_the_param_segment() {
        let program = compile("int id(int v) { return v; } void main() { id(3); }");
        let load = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::LoadVar)
            .expect("load");
        assert_eq!(load.operands[0], PARAM_BASE);
    }

    #[test]
    fn return_frees_the_frame_first() {
        let program = compile("int f() { int a = 1; return a; } void main() { f(); }");
        let ops = opcodes(&program);
        let ret_at = ops.iter().position(|o| *o == Opcode::Ret).unwrap();
        assert_eq!(ops[ret_at - 1], Opcode::FreeFrame);
    }

    #[test]
    fn bitfield_access_uses_bit_instructions() {
        let program = compile(
            "struct R { int a:4; int b:12; };\n\
             void main() { R r; r.a = 3; int x = r.b; }",
        );
        let store_bit = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::StoreStructMemberBit)
            .expect("bit store");
        assert_eq!(&store_bit.operands[1..], &[0, 0, 4]);
        let load_bit = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::LoadStructMemberBit)
            .expect("bit load");
        assert_eq!(&load_bit.operands[1..], &[0, 4, 12]);
    }

    #[test]
    fn nested_member_offsets_accumulate() {
        let program = compile(
            "struct In { int a; int b; };\n\
             struct Out { struct In first; struct In second; };\n\
             void main() { Out o; o.second.b = 5; }",
        );
        let store = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::StoreStructMember)
            .expect("member store");
        // second starts at 8, b sits at +4.
        assert_eq!(store.operands[1], 12);
    }

    #[test]
    fn pointer_member_goes_through_deref() {
        let program = compile(
            "struct P { int x; int y; };\n\
             void use(P* p) { p->y = 1; }\n\
             void main() { P v; use(&v); }",
        );
        let ops = opcodes(&program);
        assert!(ops.contains(&Opcode::StoreDeref));
        assert!(ops.contains(&Opcode::LoadAddr));
    }

    #[test]
    fn message_ops_reference_the_queue_id() {
        let program = compile(
            "message<int> Q;\n\
             void main() { Q.send(1); int v = Q.recv(); int w = Q.recv(50); }",
        );
        let declare = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::MsgDeclare)
            .expect("declare");
        assert_eq!(declare.operands[0], 0);
        assert_eq!(
            program.strings[declare.operands[1] as usize],
            "int"
        );

        // recv with no timeout loads the blocking sentinel first.
        let recv_at = program
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::MsgRecv)
            .expect("recv");
        let sentinel = &program.instructions[recv_at - 1];
        assert_eq!(sentinel.opcode, Opcode::LoadConst);
        assert_eq!(
            program.constants[sentinel.operands[0] as usize],
            ConstValue::Int(RECV_BLOCKING_SENTINEL)
        );
    }

    #[test]
    fn start_task_lowers_to_create_task() {
        let program = compile(
            "void worker() { }\n\
             void main() { StartTask(1024, 0, 5, 1, worker); }",
        );
        let ops = opcodes(&program);
        assert!(ops.contains(&Opcode::RtosCreateTask));
        // The function-pointer constant was patched to worker's address.
        let worker = program.functions["worker"];
        assert!(program
            .constants
            .iter()
            .any(|c| *c == ConstValue::Int(i64::from(worker))));
    }

    #[test]
    fn printf_counts_value_arguments() {
        let program = compile("void main() { printf(\"{} {}\", 1, 2); }");
        let printf = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::DbgPrintf)
            .expect("printf");
        assert_eq!(printf.operands, vec![0, 2]);
        assert_eq!(program.strings[0], "{} {}");
    }

    #[test]
    fn logical_and_normalizes_operands() {
        let program = compile("void main() { int x = 2 && 4; }");
        let ops = opcodes(&program);
        let and_at = ops.iter().position(|o| *o == Opcode::And).unwrap();
        assert_eq!(ops[and_at - 1], Opcode::Neq);
    }

    #[test]
    fn shifts_lower_to_mul_div() {
        let program = compile("void main() { int a = 1; int x = a << 3; int y = a >> 1; }");
        let ops = opcodes(&program);
        assert!(ops.contains(&Opcode::Mul));
        assert!(ops.contains(&Opcode::Div));
    }

    #[test]
    fn arrays_allocate_and_index() {
        let program = compile(
            "void main() { int a[3] = {1, 2, 3}; int x = a[1]; }",
        );
        let ops = opcodes(&program);
        assert!(ops.contains(&Opcode::AllocArray));
        assert_eq!(
            ops.iter().filter(|o| **o == Opcode::StoreArrayElem).count(),
            3
        );
        assert!(ops.contains(&Opcode::LoadArrayElem));
    }

    #[test]
    fn struct_layouts_are_exported() {
        let program = compile(
            "struct P { int x; int y; }; void main() { P p; p.x = 1; }",
        );
        assert_eq!(program.struct_layouts["P"]["y"], 4);
    }

    #[test]
    fn debug_mode_emits_comments_and_lines() {
        let tokens = Lexer::new("void main() { int x = 1; }", "test.rtmc")
            .tokenize()
            .expect("lexes");
        let ast = AstParser::new(tokens).parse().expect("parses");
        let mut layouts = StructLayoutTable::new();
        let program = generate(&ast, &mut layouts, CompileMode::Debug).expect("generates");
        assert!(program
            .instructions
            .iter()
            .any(|i| i.opcode == Opcode::Comment));
        assert!(!program.debug_info.is_empty());

        let release = {
            let tokens = Lexer::new("void main() { int x = 1; }", "test.rtmc")
                .tokenize()
                .expect("lexes");
            let ast = AstParser::new(tokens).parse().expect("parses");
            let mut layouts = StructLayoutTable::new();
            generate(&ast, &mut layouts, CompileMode::Release).expect("generates")
        };
        assert!(release
            .instructions
            .iter()
            .all(|i| i.opcode != Opcode::Comment && i.line == 0));
    }

    #[test]
    fn undefined_variable_is_fatal() {
        let tokens = Lexer::new("void main() { x = 1; }", "test.rtmc")
            .tokenize()
            .expect("lexes");
        let ast = AstParser::new(tokens).parse().expect("parses");
        let mut layouts = StructLayoutTable::new();
        let err = generate(&ast, &mut layouts, CompileMode::Release).unwrap_err();
        assert!(matches!(err, CodeGenError::UndefinedVariable { .. }));
    }
}
