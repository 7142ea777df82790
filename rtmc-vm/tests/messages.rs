//! Message queue semantics across real task workers: FIFO order, receive
//! timeouts and the blocking form.

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
fn same_task_send_then_receive_is_fifo() {
    let lines = output(
        r#"
        message<int> Q;
        void main() {
            Q.send(10);
            Q.send(20);
            Q.send(30);
            printf("{}", Q.recv(5));
            printf("{}", Q.recv(5));
            printf("{}", Q.recv(5));
        }
        "#,
    );
    assert_eq!(lines, vec!["10", "20", "30"]);
}

#[test]
fn empty_queue_times_out_with_sentinel() {
    let lines = output(
        r#"
        message<int> Q;
        void main() { printf("{}", Q.recv(20)); }
        "#,
    );
    assert_eq!(lines, vec!["-1"]);
}

#[test]
fn producer_consumer_with_timeouts() {
    // Producer sends 1, 2, 3 at 100 ms intervals while the consumer polls
    // with 50 ms timeouts: the consumer must observe at least one timeout
    // and the three values in order.
    let lines = output(
        r#"
        message<int> Q;
        void producer() {
            RTOS_DELAY_MS(100);
            Q.send(1);
            RTOS_DELAY_MS(100);
            Q.send(2);
            RTOS_DELAY_MS(100);
            Q.send(3);
        }
        void main() {
            StartTask(1024, 0, 5, 1, producer);
            for (int i = 0; i < 10; i++) {
                printf("got {}", Q.recv(50));
            }
        }
        "#,
    );

    assert!(
        lines.iter().any(|l| l == "got -1"),
        "expected at least one timeout in {lines:?}"
    );
    let position = |needle: &str| {
        lines
            .iter()
            .position(|l| l == needle)
            .unwrap_or_else(|| panic!("missing '{needle}' in {lines:?}"))
    };
    let (one, two, three) = (position("got 1"), position("got 2"), position("got 3"));
    assert!(one < two && two < three, "out of order: {lines:?}");
}

#[test]
fn argument_less_recv_blocks_until_data() {
    let lines = output(
        r#"
        message<int> Q;
        void feeder() {
            RTOS_DELAY_MS(50);
            Q.send(42);
        }
        void main() {
            StartTask(512, 0, 5, 1, feeder);
            printf("{}", Q.recv());
        }
        "#,
    );
    assert_eq!(lines, vec!["42"]);
}

#[test]
fn cross_task_fifo_order_is_preserved() {
    let lines = output(
        r#"
        message<int> Q;
        void producer() {
            for (int i = 1; i <= 5; i++) { Q.send(i * 11); }
        }
        void main() {
            StartTask(1024, 0, 5, 1, producer);
            for (int i = 0; i < 5; i++) { printf("{}", Q.recv(500)); }
        }
        "#,
    );
    assert_eq!(lines, vec!["11", "22", "33", "44", "55"]);
}

#[test]
fn full_queue_drops_excess_messages() {
    // Capacity is 10; the eleventh send is dropped, so the receiver drains
    // exactly the first ten values.
    let lines = output(
        r#"
        message<int> Q;
        void main() {
            for (int i = 0; i < 11; i++) { Q.send(i); }
            int last = 0;
            int count = 0;
            int v = Q.recv(5);
            while (v != -1) {
                last = v;
                count = count + 1;
                v = Q.recv(5);
            }
            printf("{} {}", count, last);
        }
        "#,
    );
    assert_eq!(lines, vec!["10 9"]);
}

#[test]
fn queues_carry_floats_too() {
    let lines = output(
        r#"
        message<float> Temps;
        void main() {
            Temps.send(21.5);
            printf("{}", Temps.recv(5));
        }
        "#,
    );
    assert_eq!(lines, vec!["21.5"]);
}
