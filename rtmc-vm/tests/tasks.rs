//! Task lifecycle, semaphores, hardware access and per-task error
//! isolation.

use std::sync::Arc;

use rtmc_compiler::{compile_source, CompileOptions};
use rtmc_vm::{CaptureSink, Machine, TaskState};

fn machine_for(source: &str, sink: &Arc<CaptureSink>) -> Machine {
    let program = compile_source(source, "test.rtmc", &CompileOptions::default())
        .expect("program compiles");
    Machine::with_output(program, Arc::clone(sink) as Arc<dyn rtmc_vm::OutputSink>).expect("loads")
}

fn run(source: &str) -> (Vec<String>, Machine) {
    let sink = Arc::new(CaptureSink::new());
    let machine = machine_for(source, &sink);
    machine.run();
    (sink.lines(), machine)
}

#[test]
fn spawned_task_runs_to_completion() {
    let (lines, machine) = run(
        r#"
        void worker() { printf("worker ran"); }
        void main() {
            StartTask(1024, 0, 5, 1, worker);
            RTOS_DELAY_MS(50);
            printf("main done");
        }
        "#,
    );
    assert!(lines.contains(&"worker ran".to_owned()));
    assert!(lines.contains(&"main done".to_owned()));
    assert!(machine
        .tasks()
        .iter()
        .all(|t| t.state == TaskState::Deleted));
}

#[test]
fn runtime_error_kills_only_the_failing_task() {
    let (lines, _) = run(
        r#"
        void crasher() {
            int zero = 0;
            int x = 1 / zero;
            printf("unreachable {}", x);
        }
        void main() {
            StartTask(512, 0, 5, 1, crasher);
            RTOS_DELAY_MS(50);
            printf("alive");
        }
        "#,
    );
    assert!(lines.contains(&"alive".to_owned()));
    assert!(!lines.iter().any(|l| l.starts_with("unreachable")));
}

#[test]
fn semaphore_take_give_cycle() {
    let (lines, _) = run(
        r#"
        void main() {
            int sem = RTOS_SEMAPHORE_CREATE();
            printf("first {}", RTOS_SEMAPHORE_TAKE(sem, 10));
            printf("second {}", RTOS_SEMAPHORE_TAKE(sem, 10));
            RTOS_SEMAPHORE_GIVE(sem);
            printf("third {}", RTOS_SEMAPHORE_TAKE(sem, 10));
        }
        "#,
    );
    assert_eq!(lines, vec!["first 1", "second 0", "third 1"]);
}

#[test]
fn semaphore_timeout_waits_for_the_holder() {
    // The worker holds the semaphore for ~40 ms; main's 200 ms timeout is
    // long enough to observe the release.
    let (lines, _) = run(
        r#"
        int sem = 0;
        void holder() {
            RTOS_DELAY_MS(40);
            RTOS_SEMAPHORE_GIVE(sem);
        }
        void main() {
            sem = RTOS_SEMAPHORE_CREATE();
            RTOS_SEMAPHORE_TAKE(sem, 10);
            StartTask(512, 0, 5, 1, holder);
            printf("waited {}", RTOS_SEMAPHORE_TAKE(sem, 200));
        }
        "#,
    );
    assert_eq!(lines, vec!["waited 1"]);
}

#[test]
fn gpio_drives_and_reads_back() {
    let (lines, machine) = run(
        r#"
        void main() {
            HW_GPIO_INIT(13, 1);
            HW_GPIO_SET(13, 1);
            printf("pin {}", HW_GPIO_GET(13));
        }
        "#,
    );
    assert_eq!(lines, vec!["pin 1"]);
    assert_eq!(machine.gpio_level(13), Some(1));
}

#[test]
fn uninitialized_peripheral_terminates_the_task() {
    let (lines, _) = run(
        r#"
        void main() {
            printf("before");
            HW_GPIO_SET(13, 1);
            printf("after");
        }
        "#,
    );
    assert_eq!(lines, vec!["before"]);
}

#[test]
fn adc_reads_are_in_range() {
    let (lines, _) = run(
        r#"
        void main() {
            HW_ADC_INIT(2);
            int sample = HW_ADC_READ(2);
            printf("{}", sample >= 0 && sample < 4096);
        }
        "#,
    );
    assert_eq!(lines, vec!["1"]);
}

#[test]
fn uart_transmits_buffer_bytes() {
    let (lines, _) = run(
        r#"
        void main() {
            char msg[4] = {'p', 'i', 'n', 'g'};
            HW_UART_WRITE(msg, 4);
            printf("sent");
        }
        "#,
    );
    assert_eq!(lines, vec!["sent"]);
}

#[test]
fn timers_configure_and_set_pwm() {
    let (lines, _) = run(
        r#"
        void main() {
            HW_TIMER_INIT(0, 1, 1000);
            HW_TIMER_START(0);
            HW_TIMER_SET_PWM_DUTY(0, 75);
            HW_TIMER_STOP(0);
            printf("timer ok");
        }
        "#,
    );
    assert_eq!(lines, vec!["timer ok"]);
}

#[test]
fn i2c_write_then_read() {
    let (lines, _) = run(
        r#"
        void main() {
            HW_I2C_WRITE(80, 171);
            printf("{}", HW_I2C_READ(80, 0));
        }
        "#,
    );
    assert_eq!(lines, vec!["171"]);
}

#[test]
fn suspended_tasks_do_not_run_until_resumed() {
    let (lines, _) = run(
        r#"
        message<int> Done;
        void worker() {
            RTOS_DELAY_MS(30);
            Done.send(7);
        }
        void main() {
            StartTask(512, 0, 5, 3, worker);
            RTOS_SUSPEND_TASK(3);
            int quick = Done.recv(100);
            RTOS_RESUME_TASK(3);
            int later = Done.recv(500);
            printf("{} {}", quick, later);
        }
        "#,
    );
    // While suspended the worker cannot send; after resume it does.
    assert_eq!(lines, vec!["-1 7"]);
}
