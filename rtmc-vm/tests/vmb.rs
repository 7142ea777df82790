//! The whole toolchain through the on-disk format: compile, serialize,
//! deserialize, execute.

use std::sync::Arc;

use rtmc_asm::encoding;
use rtmc_compiler::{compile_source, CompileOptions};
use rtmc_vm::{CaptureSink, Machine};

#[test]
fn serialized_programs_run_identically() {
    let source = r#"
        struct R { int a:4; int b:12; };
        message<int> Q;
        int scale(int v) { return v * 3; }
        void main() {
            R r;
            r.a = 5;
            r.b = 77;
            Q.send(scale(r.b));
            printf("{} {}", r.a, Q.recv(10));
        }
    "#;

    let run = |program| {
        let sink = Arc::new(CaptureSink::new());
        let machine = Machine::with_output(program, Arc::clone(&sink) as Arc<dyn rtmc_vm::OutputSink>).expect("loads");
        machine.run();
        sink.lines()
    };

    let program = compile_source(source, "test.rtmc", &CompileOptions::default())
        .expect("compiles");
    let direct = run(program.clone());

    let decoded = encoding::from_bytes(&encoding::to_bytes(&program)).expect("decodes");
    assert_eq!(decoded.instructions.len(), program.instructions.len());
    let through_disk = run(decoded);

    assert_eq!(direct, vec!["5 231"]);
    assert_eq!(direct, through_disk);
}

#[test]
fn release_mode_round_trips_exactly() {
    let options = CompileOptions {
        mode: rtmc_asm::CompileMode::Release,
        ..Default::default()
    };
    let program = compile_source(
        "int f(int x) { return x + 1; } void main() { f(1); }",
        "test.rtmc",
        &options,
    )
    .expect("compiles");

    let decoded = encoding::from_bytes(&encoding::to_bytes(&program)).expect("decodes");
    assert_eq!(decoded, program);
}
