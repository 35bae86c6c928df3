//! Scenario tests on the simulation port.
//!
//! Every test boots its own kernel, lets the tasks record what they see in a
//! shared [`Trace`], and checks the order of events once the last task is
//! done. Ticks come from the simulated idle task, so time only advances
//! while every other task is blocked.

#[cfg(test)]
mod scheduling_tests {
    use crate::config::KernelConfig;
    use crate::tests::helpers::{boot, kernel, spawn, Trace};
    use crate::TaskBuilder;
    use alloc::format;

    #[test]
    fn test_higher_priority_task_preempts_on_startup() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        let t = trace.clone();
        spawn(k, "low", 10, move || {
            t.push("low-start");
            let t2 = t.clone();
            let high = k.task_create("high", 2, 2048, move || t2.push("high")).expect("create");
            k.task_startup(high).expect("startup");
            t.push("low-end");
        });

        boot(k);
        assert_eq!(trace.wait_for("low-end"), ["low-start", "high", "low-end"]);
    }

    #[test]
    fn test_yield_alternates_equal_priorities() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        for name in ["a", "b"] {
            let t = trace.clone();
            spawn(k, name, 6, move || {
                t.push(format!("{}1", name));
                k.task_yield();
                t.push(format!("{}2", name));
            });
        }

        boot(k);
        let events = trace.wait_for("b2");
        assert_eq!(events, ["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_time_slice_round_robin() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        for name in ["a", "b"] {
            let t = trace.clone();
            TaskBuilder::new(name)
                .priority(5)
                .stack_size(2048)
                .time_slice(2)
                .spawn(k, move || {
                    for _ in 0..4 {
                        t.push(name);
                        // Stand-in for the periodic timer interrupt.
                        k.interrupt_enter();
                        k.tick_increase();
                        k.interrupt_leave();
                    }
                    t.push(format!("{}-done", name));
                })
                .expect("spawn");
        }

        boot(k);
        let events = trace.wait_for("b-done");
        assert_eq!(events[..8], ["a", "a", "b", "b", "a", "a", "b", "b"]);
    }

    #[test]
    fn test_sched_lock_defers_preemption() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        let t = trace.clone();
        spawn(k, "low", 10, move || {
            k.sched_lock();
            let t2 = t.clone();
            spawn(k, "high", 2, move || t2.push("high"));
            t.push(format!("sleep={:?}", k.task_sleep(1)));
            k.sched_unlock().expect("unlock");
            t.push(format!("extra-unlock={:?}", k.sched_unlock()));
        });

        boot(k);
        let events = trace.wait_for("extra-unlock=Err(InvalidState)");
        assert_eq!(
            events,
            ["sleep=Err(InvalidState)", "high", "extra-unlock=Err(InvalidState)"]
        );
    }

    #[test]
    fn test_suspend_and_resume() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        let t = trace.clone();
        let a = spawn(k, "a", 3, move || {
            t.push("a1");
            let me = k.task_self().expect("task context");
            k.task_suspend(me).expect("suspend");
            t.push("a2");
        });
        let t = trace.clone();
        spawn(k, "b", 5, move || {
            t.push(format!("a-state={:?}", k.task_state(a).expect("state")));
            k.task_resume(a).expect("resume");
            t.push("b-end");
        });

        boot(k);
        assert_eq!(
            trace.wait_for("b-end"),
            ["a1", "a-state=Suspended", "a2", "b-end"]
        );
    }

    #[test]
    fn test_idle_task_stays_runnable() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        let t = trace.clone();
        spawn(k, "a", 5, move || {
            let idle = k.task_find("idle").expect("idle task");
            t.push(format!("suspend-idle={:?}", k.task_suspend(idle)));
            t.push(format!("raise-idle={:?}", k.task_set_priority(idle, 3)));
            let kept = k.task_priority(idle) == Ok(k.config().idle_priority());
            t.push(format!("idle-priority-kept={}", kept));
            // Only the idle task advances time here.
            k.task_sleep(5).expect("sleep");
            t.push("woke");
        });

        boot(k);
        assert_eq!(
            trace.wait_for("woke"),
            [
                "suspend-idle=Err(InvalidState)",
                "raise-idle=Err(InvalidState)",
                "idle-priority-kept=true",
                "woke"
            ]
        );
    }

    #[test]
    fn test_destroy_interrupted_task_from_handler_is_rejected() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        let t = trace.clone();
        spawn(k, "a", 5, move || {
            let me = k.task_self().expect("task context");
            k.interrupt_enter();
            let result = k.task_destroy(me);
            k.interrupt_leave();
            t.push(format!("destroy-in-isr={:?}", result));
        });
        let t = trace.clone();
        spawn(k, "b", 6, move || t.push("b"));

        boot(k);
        assert_eq!(trace.wait_for("b"), ["destroy-in-isr=Err(InvalidState)", "b"]);
    }

    #[test]
    fn test_exit_runs_cleanup_in_idle() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();

        let t = trace.clone();
        spawn(k, "parent", 5, move || {
            let body = t.clone();
            let cleanup = t.clone();
            TaskBuilder::new("child")
                .priority(3)
                .stack_size(2048)
                .cleanup(move || cleanup.push("cleanup"))
                .spawn(k, move || body.push("body"))
                .expect("spawn child");
            k.task_sleep(2).expect("sleep");
            t.push(format!("count={}", k.task_count()));
        });

        boot(k);
        // parent + idle
        assert_eq!(trace.wait_for("count=2"), ["body", "cleanup", "count=2"]);
    }

    #[test]
    fn test_destroy_blocked_task() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let sem = k.sem_create(0, 1).expect("sem");

        let t = trace.clone();
        let cleanup = trace.clone();
        let waiter = TaskBuilder::new("waiter")
            .priority(3)
            .stack_size(2048)
            .cleanup(move || cleanup.push("cleanup"))
            .spawn(k, move || {
                let _ = k.sem_wait(sem, crate::Timeout::Forever);
                t.push("waiter-returned");
            })
            .expect("spawn");

        let t = trace.clone();
        spawn(k, "killer", 5, move || {
            k.task_destroy(waiter).expect("destroy");
            t.push(format!("waiters={}", k.sem_waiters(sem).expect("sem")));
            t.push(format!("queues={:?}", k.check_queues()));
            t.push(format!("state={:?}", k.task_state(waiter)));
        });

        boot(k);
        let events = trace.wait_for("state=Err(InvalidArgument)");
        assert_eq!(
            events,
            ["cleanup", "waiters=0", "queues=Ok(())", "state=Err(InvalidArgument)"]
        );
        assert!(!events.iter().any(|e| e == "waiter-returned"));
    }
}

#[cfg(test)]
mod ipc_tests {
    use crate::config::KernelConfig;
    use crate::sync::{EventOption, WakePolicy};
    use crate::tests::helpers::{boot, kernel, spawn, Trace};
    use crate::Timeout;
    use alloc::format;

    #[test]
    fn test_semaphore_hands_off_to_waiter() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let sem = k.sem_create(0, 1).expect("sem");

        let t = trace.clone();
        spawn(k, "consumer", 3, move || {
            t.push(format!("wait={:?}", k.sem_wait(sem, Timeout::Forever)));
            t.push(format!("count={}", k.sem_count(sem).expect("sem")));
        });
        let t = trace.clone();
        spawn(k, "producer", 5, move || {
            t.push("post");
            k.sem_post(sem).expect("post");
            t.push("producer-end");
        });

        boot(k);
        assert_eq!(
            trace.wait_for("producer-end"),
            ["post", "wait=Ok(())", "count=0", "producer-end"]
        );
    }

    #[test]
    fn test_semaphore_wait_times_out() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let sem = k.sem_create(0, 1).expect("sem");

        let t = trace.clone();
        spawn(k, "waiter", 5, move || {
            let start = k.tick_get();
            let result = k.sem_wait(sem, Timeout::Ticks(5));
            t.push(format!("{:?} after {}", result, k.tick_get().wrapping_sub(start)));
            t.push(format!("waiters={}", k.sem_waiters(sem).expect("sem")));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("waiters=0"),
            ["Err(Timeout) after 5", "waiters=0"]
        );
    }

    #[test]
    fn test_timeout_and_post_on_same_tick() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let sem = k.sem_create(0, SEM_MAX).expect("sem");

        let t = trace.clone();
        spawn(k, "waiter", 5, move || {
            let timer = k
                .timer_create("poster", 3, false, move |k: &crate::tests::helpers::SimKernel| {
                    let _ = k.sem_post(sem);
                })
                .expect("timer");
            k.timer_start(timer).expect("start");
            let result = k.sem_wait(sem, Timeout::Ticks(3));
            t.push(format!("wait={:?}", result));
            k.task_sleep(1).expect("sleep");
            t.push(format!("count={}", k.sem_count(sem).expect("sem")));
        });

        boot(k);
        // The deadline wins; the late post is kept as a count.
        assert_eq!(
            trace.wait_for("count=1"),
            ["wait=Err(Timeout)", "count=1"]
        );
    }

    const SEM_MAX: u32 = 4;

    #[test]
    fn test_post_from_interrupt_defers_switch() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let sem = k.sem_create(0, 1).expect("sem");

        let t = trace.clone();
        spawn(k, "handler", 3, move || {
            k.sem_wait(sem, Timeout::Forever).expect("wait");
            t.push("handler-woken");
        });
        let t = trace.clone();
        spawn(k, "device", 8, move || {
            k.interrupt_enter();
            k.sem_post(sem).expect("post");
            t.push(format!("in-isr nest={}", k.interrupt_nest()));
            k.interrupt_leave();
            t.push("device-after");
        });

        boot(k);
        assert_eq!(
            trace.wait_for("device-after"),
            ["in-isr nest=1", "handler-woken", "device-after"]
        );
    }

    #[test]
    fn test_destroy_wakes_semaphore_waiters() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let sem = k.sem_create(0, 1).expect("sem");

        for name in ["w1", "w2"] {
            let t = trace.clone();
            spawn(k, name, 3, move || {
                t.push(format!("{}={:?}", name, k.sem_wait(sem, Timeout::Forever)));
            });
        }
        let t = trace.clone();
        spawn(k, "owner", 6, move || {
            k.sem_destroy(sem).expect("destroy");
            t.push("destroyed");
        });

        boot(k);
        assert_eq!(
            trace.wait_for("destroyed"),
            ["w1=Err(Destroyed)", "w2=Err(Destroyed)", "destroyed"]
        );
    }

    #[test]
    fn test_event_wakes_and_clears() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let event = k.event_create(WakePolicy::Fifo).expect("event");

        let t = trace.clone();
        spawn(k, "all", 3, move || {
            let got = k
                .event_recv(event, 0b11, EventOption::AND | EventOption::CLEAR, Timeout::Forever)
                .expect("recv");
            t.push(format!("all={:#b}", got));
        });
        let t = trace.clone();
        spawn(k, "any", 4, move || {
            let got = k
                .event_recv(event, 0b01, EventOption::OR, Timeout::Forever)
                .expect("recv");
            t.push(format!("any={:#b}", got));
        });
        let t = trace.clone();
        spawn(k, "sender", 10, move || {
            k.event_send(event, 0b01).expect("send");
            t.push("sent-first");
            k.event_send(event, 0b10).expect("send");
            t.push(format!("left={:#b}", k.event_get(event).expect("get")));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("left=0b0"),
            ["any=0b1", "sent-first", "all=0b11", "left=0b0"]
        );
    }

    #[test]
    fn test_event_recv_times_out() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let event = k.event_create(WakePolicy::Fifo).expect("event");

        let t = trace.clone();
        spawn(k, "waiter", 5, move || {
            let r = k.event_recv(event, 0b100, EventOption::AND, Timeout::Ticks(3));
            t.push(format!("{:?}", r));
            t.push(format!("waiters={}", k.event_waiters(event).expect("event")));
            t.push(format!("queues={:?}", k.check_queues()));
            let r = k.event_recv(event, 0b100, EventOption::OR, Timeout::NoWait);
            t.push(format!("{:?}", r));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("Err(Empty)"),
            ["Err(Timeout)", "waiters=0", "queues=Ok(())", "Err(Empty)"]
        );
    }

    #[test]
    fn test_mailbox_blocks_when_full() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let mb = k.mailbox_create(1, WakePolicy::Fifo).expect("mailbox");

        let t = trace.clone();
        spawn(k, "sender", 3, move || {
            k.mailbox_send(mb, 1, Timeout::Forever).expect("send");
            t.push(format!("full={:?}", k.mailbox_send(mb, 9, Timeout::NoWait)));
            k.mailbox_send(mb, 2, Timeout::Forever).expect("send");
            t.push("sent-2");
        });
        let t = trace.clone();
        spawn(k, "receiver", 5, move || {
            for _ in 0..2 {
                let v = k.mailbox_recv(mb, Timeout::Forever).expect("recv");
                t.push(format!("got={}", v));
            }
            t.push(format!("empty={:?}", k.mailbox_recv(mb, Timeout::NoWait)));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("empty=Err(Empty)"),
            ["full=Err(Full)", "sent-2", "got=1", "got=2", "empty=Err(Empty)"]
        );
    }

    #[test]
    fn test_mailbox_direct_handoff() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let mb = k.mailbox_create(2, WakePolicy::Fifo).expect("mailbox");

        let t = trace.clone();
        spawn(k, "receiver", 3, move || {
            for _ in 0..2 {
                let v = k.mailbox_recv(mb, Timeout::Forever).expect("recv");
                t.push(format!("got={}", v));
            }
        });
        let t = trace.clone();
        spawn(k, "sender", 5, move || {
            for v in [7, 8] {
                k.mailbox_send(mb, v, Timeout::NoWait).expect("send");
                t.push(format!("len={}", k.mailbox_len(mb).expect("len")));
            }
            t.push("sender-done");
        });

        boot(k);
        let events = trace.wait_for("sender-done");
        assert_eq!(events, ["got=7", "len=0", "got=8", "len=0", "sender-done"]);
    }

    #[test]
    fn test_mq_handoff_to_waiting_receiver() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let mq = k.mq_create(16, 2, WakePolicy::Fifo).expect("mq");

        let t = trace.clone();
        spawn(k, "receiver", 3, move || {
            let mut buf = [0u8; 16];
            let len = k.mq_recv(mq, &mut buf, Timeout::Forever).expect("recv");
            t.push(format!("got={}", core::str::from_utf8(&buf[..len]).expect("utf8")));
        });
        let t = trace.clone();
        spawn(k, "sender", 5, move || {
            k.mq_send(mq, b"hello", Timeout::NoWait).expect("send");
            t.push(format!("queued={}", k.mq_len(mq).expect("len")));
        });

        boot(k);
        assert_eq!(trace.wait_for("queued=0"), ["got=hello", "queued=0"]);
    }

    #[test]
    fn test_mq_blocked_urgent_sender_goes_first() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let mq = k.mq_create(8, 1, WakePolicy::Fifo).expect("mq");

        let t = trace.clone();
        spawn(k, "sender", 3, move || {
            k.mq_send(mq, b"first", Timeout::NoWait).expect("send");
            k.mq_send_urgent(mq, b"urgent", Timeout::Forever).expect("send");
            t.push("sender-done");
        });
        let t = trace.clone();
        spawn(k, "receiver", 5, move || {
            let mut buf = [0u8; 8];
            for _ in 0..2 {
                let len = k.mq_recv(mq, &mut buf, Timeout::Forever).expect("recv");
                t.push(format!("got={}", core::str::from_utf8(&buf[..len]).expect("utf8")));
            }
            t.push(format!("queues={:?}", k.check_queues()));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("queues=Ok(())"),
            ["sender-done", "got=first", "got=urgent", "queues=Ok(())"]
        );
    }

    #[test]
    fn test_mq_send_times_out_and_reset_wakes_receivers() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let full = k.mq_create(4, 1, WakePolicy::Fifo).expect("mq");
        let empty = k.mq_create(4, 1, WakePolicy::Fifo).expect("mq");

        let t = trace.clone();
        spawn(k, "receiver", 3, move || {
            let mut buf = [0u8; 4];
            t.push(format!("recv={:?}", k.mq_recv(empty, &mut buf, Timeout::Forever)));
        });
        let t = trace.clone();
        spawn(k, "sender", 5, move || {
            k.mq_send(full, b"a", Timeout::NoWait).expect("send");
            t.push(format!("send={:?}", k.mq_send(full, b"b", Timeout::Ticks(3))));
            t.push(format!("len={}", k.mq_len(full).expect("len")));
            k.mq_reset(empty).expect("reset");
            t.push(format!("queues={:?}", k.check_queues()));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("queues=Ok(())"),
            ["send=Err(Timeout)", "len=1", "recv=Err(Destroyed)", "queues=Ok(())"]
        );
    }
}

#[cfg(test)]
mod mutex_tests {
    use crate::config::KernelConfig;
    use crate::sync::WakePolicy;
    use crate::tests::helpers::{boot, kernel, spawn, Trace};
    use crate::Timeout;
    use alloc::format;

    #[test]
    fn test_priority_inheritance_bounds_inversion() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let m = k.mutex_create(WakePolicy::Priority).expect("mutex");

        let t = trace.clone();
        spawn(k, "low", 10, move || {
            k.mutex_lock(m, Timeout::Forever).expect("lock");
            let me = k.task_self().expect("task context");

            let th = t.clone();
            spawn(k, "high", 2, move || {
                k.mutex_lock(m, Timeout::Forever).expect("lock");
                th.push("high-locked");
                k.mutex_unlock(m).expect("unlock");
            });
            // high is now blocked on m and lends us its priority
            t.push(format!("low-prio={}", k.task_priority(me).expect("prio")));

            let tm = t.clone();
            spawn(k, "mid", 5, move || tm.push("mid"));

            k.mutex_unlock(m).expect("unlock");
            t.push(format!("low-done prio={}", k.task_priority(me).expect("prio")));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("low-done prio=10"),
            ["low-prio=2", "high-locked", "mid", "low-done prio=10"]
        );
    }

    #[test]
    fn test_timed_out_waiter_returns_boost() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let m = k.mutex_create(WakePolicy::Priority).expect("mutex");

        let t = trace.clone();
        spawn(k, "low", 10, move || {
            k.mutex_lock(m, Timeout::Forever).expect("lock");
            let me = k.task_self().expect("task context");

            let th = t.clone();
            spawn(k, "high", 2, move || {
                let r = k.mutex_lock(m, Timeout::Ticks(5));
                let owner = k.mutex_owner(m).expect("owner");
                th.push(format!(
                    "high={:?} low-prio={} owner-is-low={}",
                    r,
                    k.task_priority(me).expect("prio"),
                    owner == Some(me)
                ));
                th.push(format!(
                    "mutex-waiters={} queues={:?}",
                    k.mutex_waiters(m).expect("mutex"),
                    k.check_queues()
                ));
            });
            t.push(format!("low-prio={}", k.task_priority(me).expect("prio")));
            k.task_sleep(20).expect("sleep");
            k.mutex_unlock(m).expect("unlock");
            t.push("low-done");
        });

        boot(k);
        assert_eq!(
            trace.wait_for("low-done"),
            [
                "low-prio=2",
                "high=Err(Timeout) low-prio=10 owner-is-low=true",
                "mutex-waiters=0 queues=Ok(())",
                "low-done"
            ]
        );
    }

    #[test]
    fn test_recursive_lock_and_foreign_unlock() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let m = k.mutex_create(WakePolicy::Priority).expect("mutex");

        let t = trace.clone();
        spawn(k, "owner", 4, move || {
            k.mutex_lock(m, Timeout::Forever).expect("lock");
            k.mutex_lock(m, Timeout::Forever).expect("relock");
            t.push(format!("nest={}", k.mutex_nest(m).expect("nest")));

            let to = t.clone();
            spawn(k, "other", 2, move || {
                to.push(format!("unlock={:?}", k.mutex_unlock(m)));
                to.push(format!("try={:?}", k.mutex_try_lock(m)));
            });

            k.mutex_unlock(m).expect("unlock");
            t.push(format!("owned={}", k.mutex_owner(m).expect("owner").is_some()));
            k.mutex_unlock(m).expect("unlock");
            t.push(format!("owned={}", k.mutex_owner(m).expect("owner").is_some()));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("owned=false"),
            [
                "nest=2",
                "unlock=Err(NotOwner)",
                "try=Err(Busy)",
                "owned=true",
                "owned=false"
            ]
        );
    }

    #[test]
    fn test_mutex_serializes_critical_sections() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let m = k.mutex_create(WakePolicy::Fifo).expect("mutex");

        for name in ["a", "b", "c"] {
            let t = trace.clone();
            spawn(k, name, 5, move || {
                k.mutex_lock(m, Timeout::Forever).expect("lock");
                t.push(format!("{}-in {:?}", name, k.check_queues()));
                // Let the others run and pile up on the mutex.
                k.task_sleep(2).expect("sleep");
                t.push(format!("{}-out", name));
                k.mutex_unlock(m).expect("unlock");
            });
        }

        boot(k);
        let events = trace.wait_for("c-out");
        assert_eq!(
            events,
            ["a-in Ok(())", "a-out", "b-in Ok(())", "b-out", "c-in Ok(())", "c-out"]
        );
    }
}

#[cfg(test)]
mod workqueue_tests {
    use crate::config::KernelConfig;
    use crate::tests::helpers::{boot, kernel, spawn, Trace, STACK};
    use crate::workqueue::WorkId;
    use alloc::format;
    use alloc::sync::Arc;
    use std::sync::Mutex;

    #[test]
    fn test_cancel_delayed_and_running_work() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let wq = k.workqueue_create("wq", 5, STACK).expect("workqueue");

        let t = trace.clone();
        spawn(k, "client", 8, move || {
            let t1 = t.clone();
            let delayed = k.work_create(move |_| t1.push("delayed-ran")).expect("work");
            k.work_submit(wq, delayed, 50).expect("submit");
            k.task_sleep(30).expect("sleep");
            t.push(format!("cancel={:?}", k.work_cancel(delayed)));
            k.task_sleep(40).expect("sleep");

            let t2 = t.clone();
            let slow = k
                .work_create(move |k| {
                    t2.push("cb-start");
                    let _ = k.task_sleep(20);
                    t2.push("cb-end");
                })
                .expect("work");
            k.work_submit(wq, slow, 0).expect("submit");
            t.push(format!("cancel-running={:?}", k.work_cancel(slow)));
            t.push(format!("cancel-sync={:?}", k.work_cancel_sync(slow)));
            t.push(format!("stage={:?}", k.work_stage(slow).expect("stage")));
        });

        boot(k);
        let events = trace.wait_for("stage=Idle");
        assert_eq!(
            events,
            [
                "cancel=Ok(())",
                "cb-start",
                "cancel-running=Err(Busy)",
                "cb-end",
                "cancel-sync=Ok(())",
                "stage=Idle"
            ]
        );
        assert!(!events.iter().any(|e| e == "delayed-ran"));
    }

    #[test]
    fn test_delayed_work_runs_after_delay() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let wq = k.workqueue_create("wq", 5, STACK).expect("workqueue");

        let t = trace.clone();
        spawn(k, "client", 8, move || {
            let t1 = t.clone();
            let work = k.work_create(move |_| t1.push("ran")).expect("work");
            k.work_submit(wq, work, 10).expect("submit");
            t.push(format!("resubmit={:?}", k.work_submit(wq, work, 0)));
            k.task_sleep(5).expect("sleep");
            t.push(format!("stage={:?}", k.work_stage(work).expect("stage")));
            k.task_sleep(15).expect("sleep");
            t.push(format!("end stage={:?}", k.work_stage(work).expect("stage")));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("end stage=Idle"),
            ["resubmit=Err(Busy)", "stage=Delayed", "ran", "end stage=Idle"]
        );
    }

    #[test]
    fn test_cancel_sync_from_worker() {
        let k = kernel(KernelConfig::new());
        let trace = Trace::new();
        let wq = k.workqueue_create("wq", 5, STACK).expect("workqueue");

        let t = trace.clone();
        spawn(k, "client", 8, move || {
            let parked = k.work_create(|_| {}).expect("work");
            k.work_submit(wq, parked, 100).expect("submit");

            // A callback may cancel other items of its queue, but cannot
            // wait for itself.
            let own: Arc<Mutex<Option<WorkId>>> = Arc::new(Mutex::new(None));
            let t1 = t.clone();
            let own_id = own.clone();
            let canceller = k
                .work_create(move |k| {
                    t1.push(format!("parked={:?}", k.work_cancel_sync(parked)));
                    t1.push(format!("parked-stage={:?}", k.work_stage(parked).expect("stage")));
                    if let Some(me) = *own_id.lock().expect("own id") {
                        t1.push(format!("self={:?}", k.work_cancel_sync(me)));
                    }
                })
                .expect("work");
            *own.lock().expect("own id") = Some(canceller);
            k.work_submit(wq, canceller, 0).expect("submit");
            t.push(format!("after={:?}", k.work_stage(canceller).expect("stage")));
        });

        boot(k);
        assert_eq!(
            trace.wait_for("after=Idle"),
            [
                "parked=Ok(())",
                "parked-stage=Idle",
                "self=Err(InvalidState)",
                "after=Idle"
            ]
        );
    }

    #[test]
    fn test_system_workqueue() {
        let k = kernel(KernelConfig::new().with_system_workqueue(4, STACK));
        let trace = Trace::new();

        let t = trace.clone();
        spawn(k, "client", 8, move || {
            let t1 = t.clone();
            let work = k.work_create(move |_| t1.push("sys")).expect("work");
            k.system_work_submit(work, 0).expect("submit");
            let wq = k.system_workqueue().expect("configured");
            t.push(format!("name={}", k.workqueue_name(wq).expect("name")));
        });

        boot(k);
        assert_eq!(trace.wait_for("name=sys_work"), ["sys", "name=sys_work"]);
    }
}
