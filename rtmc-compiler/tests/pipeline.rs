//! Whole-pipeline checks over realistic programs, plus randomized layout
//! invariants.

use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;

use rtmc_asm::Opcode;
use rtmc_compiler::{compile_source, CompileOptions};
use rtmc_compiler::layout::StructLayoutTable;
use rtmc_compiler::{lexer::Lexer, parser::Parser};

#[test]
fn sensor_pipeline_program_compiles() {
    let source = r#"
        #define SENSOR_CHANNEL 2
        #define LED_PIN 13

        struct Reading {
            int raw;
            int scaled;
            int flags : 4;
            int channel : 4;
        };

        message<int> Samples;
        int threshold = 2048;

        int scale(int raw) {
            return raw / 2;
        }

        void sampler() {
            HW_ADC_INIT(SENSOR_CHANNEL);
            for (int i = 0; i < 8; i++) {
                int raw = HW_ADC_READ(SENSOR_CHANNEL);
                Samples.send(raw);
                RTOS_DELAY_MS(10);
            }
        }

        void main() {
            HW_GPIO_INIT(LED_PIN, 1);
            StartTask(1024, 0, 5, 1, sampler);

            Reading last;
            for (int i = 0; i < 8; i++) {
                int raw = Samples.recv(100);
                if (raw == -1) { continue; }
                last.raw = raw;
                last.scaled = scale(raw);
                last.channel = SENSOR_CHANNEL;
                if (last.scaled > threshold / 2) {
                    HW_GPIO_SET(LED_PIN, 1);
                } else {
                    HW_GPIO_SET(LED_PIN, 0);
                }
            }
            printf("last: {} / {}", last.raw, last.scaled);
        }
    "#;

    let program = compile_source(source, "sensor.rtmc", &CompileOptions::default())
        .expect("compiles");

    assert!(program.functions.contains_key("sampler"));
    assert!(program.functions.contains_key("scale"));
    assert_eq!(program.symbols["threshold"], 0);
    assert!(program.struct_layouts.contains_key("Reading"));

    let used: Vec<Opcode> = program.instructions.iter().map(|i| i.opcode).collect();
    for expected in [
        Opcode::MsgDeclare,
        Opcode::MsgSend,
        Opcode::MsgRecv,
        Opcode::RtosCreateTask,
        Opcode::RtosDelayMs,
        Opcode::HwAdcRead,
        Opcode::HwGpioSet,
        Opcode::StoreStructMemberBit,
        Opcode::Call,
        Opcode::GlobalVarDeclare,
    ] {
        assert!(used.contains(&expected), "missing {expected}");
    }
}

#[test]
fn release_and_debug_agree_modulo_annotations() {
    let source = "int f(int a) { return a * 2; } void main() { printf(\"{}\", f(21)); }";

    let debug = compile_source(
        source,
        "t.rtmc",
        &CompileOptions {
            mode: rtmc_asm::CompileMode::Debug,
            ..Default::default()
        },
    )
    .expect("debug compiles");
    let release = compile_source(
        source,
        "t.rtmc",
        &CompileOptions {
            mode: rtmc_asm::CompileMode::Release,
            ..Default::default()
        },
    )
    .expect("release compiles");

    let debug_ops: Vec<Opcode> = debug
        .instructions
        .iter()
        .map(|i| i.opcode)
        .filter(|o| *o != Opcode::Comment)
        .collect();
    let release_ops: Vec<Opcode> =
        release.instructions.iter().map(|i| i.opcode).collect();
    assert_eq!(debug_ops, release_ops);
    assert!(release.debug_info.is_empty());
    assert!(!debug.debug_info.is_empty());
}

// ---- randomized layout invariants --------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldKind {
    Int,
    Char,
    Float,
    Bits(u32),
}

#[derive(Debug, Clone)]
struct StructSpec {
    fields: Vec<FieldKind>,
    union: bool,
}

impl Arbitrary for StructSpec {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = usize::arbitrary(g) % 8 + 1;
        let fields = (0..len)
            .map(|_| match u8::arbitrary(g) % 4 {
                0 => FieldKind::Int,
                1 => FieldKind::Char,
                2 => FieldKind::Float,
                _ => FieldKind::Bits(u32::arbitrary(g) % 32 + 1),
            })
            .collect();
        StructSpec {
            fields,
            union: bool::arbitrary(g),
        }
    }
}

fn render(spec: &StructSpec) -> String {
    let keyword = if spec.union { "union" } else { "struct" };
    let mut out = format!("{keyword} S {{ ");
    for (i, field) in spec.fields.iter().enumerate() {
        match field {
            FieldKind::Int => out.push_str(&format!("int f{i}; ")),
            FieldKind::Char => out.push_str(&format!("char f{i}; ")),
            FieldKind::Float => out.push_str(&format!("float f{i}; ")),
            FieldKind::Bits(width) => out.push_str(&format!("int f{i} : {width}; ")),
        }
    }
    out.push_str("};");
    out
}

#[quickcheck]
fn qc_layout_invariants(spec: StructSpec) -> bool {
    let source = render(&spec);
    let tokens = Lexer::new(&source, "gen.rtmc").tokenize().expect("lexes");
    let ast = Parser::new(tokens).parse().expect("parses");

    let mut table = StructLayoutTable::new();
    for decl in &ast.declarations {
        match decl {
            rtmc_compiler::ast::Decl::Struct(s) => table.register_struct(s),
            rtmc_compiler::ast::Decl::Union(u) => table.register_union(u),
            _ => {}
        }
    }

    let layout = table.layout("S").expect("layout computes");

    let aligned = layout.total_size % layout.alignment == 0;
    let fields_ok = layout.fields.values().all(|f| {
        let inside = f.byte_offset < layout.total_size;
        let sized = f.is_bit_field()
            || f.byte_offset + f.size <= layout.total_size;
        let bits = !f.is_bit_field() || f.bit_offset + f.bit_width <= 32;
        let overlap = !layout.is_union || f.byte_offset == 0;
        inside && sized && bits && overlap
    });

    let union_size_ok = !layout.is_union || {
        let max = layout
            .fields
            .values()
            .map(|f| if f.is_bit_field() { 4 } else { f.size })
            .max()
            .unwrap_or(1);
        layout.total_size >= max
    };

    aligned && fields_ok && union_size_ok
}
