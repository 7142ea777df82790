//! Struct, bit-field, union and inheritance behavior on the running VM.

use std::sync::Arc;

use rtmc_compiler::{compile_source, CompileOptions};
use rtmc_vm::{CaptureSink, Machine};

fn output(source: &str) -> Vec<String> {
    let program = compile_source(source, "test.rtmc", &CompileOptions::default())
        .expect("program compiles");
    let sink = Arc::new(CaptureSink::new());
    let machine = Machine::with_output(program, Arc::clone(&sink) as Arc<dyn rtmc_vm::OutputSink>).expect("loads");
    machine.run();
    sink.lines()
}

#[test]
fn struct_members_store_and_load() {
    let lines = output(
        r#"
        struct Point { int x; int y; };
        void main() {
            Point p;
            p.x = 3;
            p.y = 4;
            printf("{} {}", p.x, p.y);
        }
        "#,
    );
    assert_eq!(lines, vec!["3 4"]);
}

#[test]
fn bitfields_pack_and_extract() {
    let lines = output(
        r#"
        struct R { int a:4; int b:12; int c:16; };
        void main() {
            R r;
            r.a = 0xF;
            r.b = 0xABC;
            r.c = 0x1234;
            printf("{} {} {}", r.a, r.b, r.c);
        }
        "#,
    );
    assert_eq!(lines, vec!["15 2748 4660"]);
}

#[test]
fn bitfield_store_leaves_neighbors_alone() {
    let lines = output(
        r#"
        struct Flags { int low:8; int high:8; };
        void main() {
            Flags f;
            f.low = 0xAA;
            f.high = 0x55;
            f.low = 0x11;
            printf("{} {}", f.low, f.high);
        }
        "#,
    );
    assert_eq!(lines, vec!["17 85"]);
}

#[test]
fn union_shares_storage_little_endian() {
    let lines = output(
        r#"
        union U { int i; char b[4]; };
        void main() {
            U u;
            u.i = 0x01020304;
            printf("{} {} {} {}", u.b[0], u.b[1], u.b[2], u.b[3]);
        }
        "#,
    );
    assert_eq!(lines, vec!["4 3 2 1"]);
}

#[test]
fn nested_struct_members_resolve() {
    let lines = output(
        r#"
        struct Inner { int a; int b; };
        struct Outer { struct Inner first; struct Inner second; };
        void main() {
            Outer o;
            o.first.a = 1;
            o.first.b = 2;
            o.second.a = 3;
            o.second.b = 4;
            printf("{} {} {} {}", o.first.a, o.first.b, o.second.a, o.second.b);
        }
        "#,
    );
    assert_eq!(lines, vec!["1 2 3 4"]);
}

#[test]
fn inherited_fields_are_part_of_the_derived_struct() {
    let lines = output(
        r#"
        struct Base { int id; };
        struct Derived : Base { int extra; };
        void main() {
            Derived d;
            d.id = 7;
            d.extra = 9;
            printf("{} {}", d.id, d.extra);
        }
        "#,
    );
    assert_eq!(lines, vec!["7 9"]);
}

#[test]
fn field_defaults_apply_on_declaration() {
    let lines = output(
        r#"
        struct Config { int mode = 3; int retries = 5; };
        void main() {
            Config c;
            printf("{} {}", c.mode, c.retries);
        }
        "#,
    );
    assert_eq!(lines, vec!["3 5"]);
}

#[test]
fn pointer_member_access_mutates_the_original() {
    let lines = output(
        r#"
        struct P { int x; int y; };
        void shift(P* p) {
            p->x = p->x + 10;
            p->y = 99;
        }
        void main() {
            P v;
            v.x = 1;
            v.y = 2;
            shift(&v);
            printf("{} {}", v.x, v.y);
        }
        "#,
    );
    assert_eq!(lines, vec!["11 99"]);
}

#[test]
fn anonymous_union_overlaps_inside_struct() {
    let lines = output(
        r#"
        struct Packet {
            int kind;
            union { int raw; char bytes[4]; };
        };
        void main() {
            Packet p;
            p.kind = 1;
            p.raw = 0x00010203;
            printf("{} {} {}", p.kind, p.bytes[0], p.bytes[1]);
        }
        "#,
    );
    assert_eq!(lines, vec!["1 3 2"]);
}

#[test]
fn compound_assignment_on_members() {
    let lines = output(
        r#"
        struct Acc { int total; };
        void main() {
            Acc a;
            a.total = 10;
            a.total += 5;
            a.total -= 3;
            printf("{}", a.total);
        }
        "#,
    );
    assert_eq!(lines, vec!["12"]);
}
