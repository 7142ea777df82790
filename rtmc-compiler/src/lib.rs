//! Compiler from RT-Micro-C source text to RTMC bytecode.
//!
//! The pipeline is `preprocess → lex → parse → analyze → optimize →
//! generate`; [`compile_file`] additionally resolves `#include` directives
//! recursively, splicing each included file's declarations ahead of the
//! including file's and dropping circular includes by canonical path.

#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod ast;
pub mod codegen;
pub mod layout;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod preprocess;
pub mod sema;
pub mod source;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use rtmc_asm::{BytecodeProgram, CompileMode};

use ast::{Decl, Program};
use codegen::CodeGenError;
use layout::StructLayoutTable;
use lexer::{LexError, Lexer, Token};
use optimizer::Optimizer;
use parser::{ParseError, Parser};
use preprocess::Preprocessor;
use sema::SemanticError;

/// Pipeline switches, mirroring the CLI flags.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub mode: CompileMode,
    /// Disable the semantic gate (`--no-semantic`).
    pub run_semantic: bool,
    /// Disable optimization (`--no-optimize`).
    pub run_optimizer: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            mode: CompileMode::Debug,
            run_semantic: true,
            run_optimizer: true,
        }
    }
}

/// Aggregated failure of any compilation stage.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("{}", join_errors(.0))]
    Parse(Vec<ParseError>),
    #[error("{}", join_errors(.0))]
    Semantic(Vec<SemanticError>),
    #[error(transparent)]
    CodeGen(#[from] CodeGenError),
}

fn join_errors<E: fmt::Display>(errors: &[E]) -> String {
    use itertools::Itertools;
    errors.iter().map(|e| e.to_string()).join("\n")
}

/// Tokenize a source string (the `--tokens` path).
pub fn tokenize(source: &str, filename: &str) -> Result<Vec<Token>, CompileError> {
    let processed = Preprocessor::new().process(source);
    Ok(Lexer::new(&processed, filename).tokenize()?)
}

/// Preprocess and parse a source string into an AST (the `--ast` path).
pub fn parse_source(source: &str, filename: &str) -> Result<Program, CompileError> {
    let processed = Preprocessor::new().process(source);
    let tokens = Lexer::new(&processed, filename).tokenize()?;
    Parser::new(tokens).parse().map_err(CompileError::Parse)
}

/// Compile a single source string (no include resolution).
pub fn compile_source(
    source: &str,
    filename: &str,
    options: &CompileOptions,
) -> Result<BytecodeProgram, CompileError> {
    let ast = parse_source(source, filename)?;
    compile_ast(ast, options)
}

/// Compile a file, resolving `#include` directives relative to it.
pub fn compile_file(
    path: &Path,
    options: &CompileOptions,
) -> Result<BytecodeProgram, CompileError> {
    let mut seen = HashSet::new();
    let ast = parse_with_includes(path, &mut seen)?;
    compile_ast(ast, options)
}

/// Run the back half of the pipeline over a parsed program.
pub fn compile_ast(
    ast: Program,
    options: &CompileOptions,
) -> Result<BytecodeProgram, CompileError> {
    let mut layouts = StructLayoutTable::new();

    if options.run_semantic {
        tracing::debug!("semantic analysis");
        sema::analyze(&ast, &mut layouts).map_err(CompileError::Semantic)?;
    }

    let ast = if options.run_optimizer {
        tracing::debug!("optimization");
        let (optimized, _warnings) = Optimizer::new(&mut layouts).optimize(ast);
        optimized
    } else {
        ast
    };

    tracing::debug!("bytecode generation");
    Ok(codegen::generate(&ast, &mut layouts, options.mode)?)
}

/// Parse `path` and every file it includes, splicing included declarations
/// ahead of the including file's. Circular and repeated includes are
/// silently dropped after the first occurrence.
pub fn parse_with_includes(
    path: &Path,
    seen: &mut HashSet<PathBuf>,
) -> Result<Program, CompileError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(canonical.clone()) {
        return Ok(Program::default());
    }

    let text = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let filename = path.to_string_lossy();
    let ast = parse_source(&text, &filename)?;

    let mut included = Vec::new();
    let mut own = Vec::new();
    for decl in ast.declarations {
        match decl {
            Decl::Include(include) => {
                let target = canonical
                    .parent()
                    .map(|dir| dir.join(&include.path))
                    .unwrap_or_else(|| PathBuf::from(&include.path));
                let sub = parse_with_includes(&target, seen)?;
                included.extend(sub.declarations);
            }
            other => own.push(other),
        }
    }

    included.extend(own);
    Ok(Program {
        declarations: included,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmc_asm::Opcode;
    use std::io::Write;

    #[test]
    fn end_to_end_compile() {
        let program = compile_source(
            "void main() { int x = 5; int y = 3; printf(\"Result: {}\", x + y); }",
            "test.rtmc",
            &CompileOptions::default(),
        )
        .expect("compiles");
        assert!(program.functions.contains_key("main"));
        assert!(program
            .instructions
            .iter()
            .any(|i| i.opcode == Opcode::DbgPrintf));
    }

    #[test]
    fn semantic_gate_blocks_bad_programs() {
        let err = compile_source(
            "void main() { undefined_name = 1; }",
            "test.rtmc",
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Semantic(_)));
    }

    #[test]
    fn no_semantic_flag_skips_the_gate() {
        // Without main, the gate would reject; with it disabled the
        // generator still runs.
        let options = CompileOptions {
            run_semantic: false,
            ..Default::default()
        };
        compile_source("int lonely() { return 1; }", "test.rtmc", &options)
            .expect("compiles without the gate");
    }

    #[test]
    fn defines_expand_before_lexing() {
        let program = compile_source(
            "#define ANSWER 42\nvoid main() { int x = ANSWER; }",
            "test.rtmc",
            &CompileOptions::default(),
        )
        .expect("compiles");
        assert!(program
            .constants
            .iter()
            .any(|c| *c == rtmc_asm::ConstValue::Int(42)));
    }

    #[test]
    fn includes_resolve_and_deduplicate() {
        let dir = tempfile::tempdir().expect("tempdir");

        let common = dir.path().join("common.rtmc");
        writeln!(
            std::fs::File::create(&common).unwrap(),
            "int shared_counter = 0;"
        )
        .unwrap();

        let a = dir.path().join("a.rtmc");
        writeln!(
            std::fs::File::create(&a).unwrap(),
            "#include \"common.rtmc\"\nint helper() {{ return shared_counter; }}"
        )
        .unwrap();

        let main = dir.path().join("main.rtmc");
        writeln!(
            std::fs::File::create(&main).unwrap(),
            "#include \"common.rtmc\"\n#include \"a.rtmc\"\nvoid main() {{ int x = helper(); }}"
        )
        .unwrap();

        let mut seen = HashSet::new();
        let ast = parse_with_includes(&main, &mut seen).expect("parses");

        // common.rtmc appears exactly once even though two files pull it in.
        let counters = ast
            .declarations
            .iter()
            .filter(|d| matches!(d, Decl::Variable(v) if v.name == "shared_counter"))
            .count();
        assert_eq!(counters, 1);

        let program = compile_ast(ast, &CompileOptions::default()).expect("compiles");
        assert!(program.symbols.contains_key("shared_counter"));
    }

    #[test]
    fn circular_includes_terminate() {
        let dir = tempfile::tempdir().expect("tempdir");

        let a = dir.path().join("a.rtmc");
        let b = dir.path().join("b.rtmc");
        writeln!(
            std::fs::File::create(&a).unwrap(),
            "#include \"b.rtmc\"\nint from_a = 1;"
        )
        .unwrap();
        writeln!(
            std::fs::File::create(&b).unwrap(),
            "#include \"a.rtmc\"\nint from_b = 2;"
        )
        .unwrap();

        let mut seen = HashSet::new();
        let ast = parse_with_includes(&a, &mut seen).expect("parses");
        assert_eq!(ast.declarations.len(), 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let mut seen = HashSet::new();
        let err = parse_with_includes(Path::new("/nonexistent.rtmc"), &mut seen)
            .unwrap_err();
        assert!(matches!(err, CompileError::Io { .. }));
    }
}
