//! Kernel integration tests - launch, delivery, timers, retirement and
//! message accounting through the public API.

use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skiff_core::kernel::{service_fn, Command, Kernel, StatKey, Target, WorkerMonitor};
use skiff_core::{Config, Context, Handle, KernelHandle, Message, MessageType, SendFlags, Service};

#[derive(Debug, Clone, PartialEq)]
struct Received {
    source: Handle,
    session: i32,
    kind: MessageType,
    payload: Vec<u8>,
}

type Inbox = Arc<Mutex<Vec<Received>>>;

fn inbox() -> Inbox {
    Arc::new(Mutex::new(Vec::new()))
}

/// Service recording every message it receives.
fn recorder(inbox: &Inbox) -> Box<dyn Service> {
    let inbox = Arc::clone(inbox);
    service_fn(move |_ctx, msg| {
        inbox.lock().push(Received {
            source: msg.source,
            session: msg.session,
            kind: msg.kind,
            payload: msg.payload().to_vec(),
        })
    })
}

fn kernel() -> Kernel {
    Kernel::new(Config::default()).unwrap()
}

#[test]
fn test_send_copies_payload() {
    let k = kernel();
    let received = inbox();
    let receiver = k.spawn("recorder", recorder(&received), "").unwrap();

    let sender = k
        .spawn(
            "sender",
            service_fn(move |ctx, _msg| {
                let mut buf = b"ping".to_vec();
                ctx.send(receiver, MessageType::TEXT, 0, &buf).unwrap();
                buf.copy_from_slice(b"pong");
            }),
            "",
        )
        .unwrap();
    k.send(Handle::NONE, sender, MessageType::TEXT, 0, Bytes::new(), SendFlags::NONE)
        .unwrap();
    k.run_until_idle();

    let got = received.lock();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, b"ping");
    assert_eq!(got[0].source, sender);
}

#[test]
fn test_send_to_null_or_retired_destination_fails() {
    let k = kernel();
    let h = k.spawn("nop", service_fn(|_, _| {}), "").unwrap();
    assert!(k
        .send(h, Handle::NONE, MessageType::TEXT, 0, Bytes::new(), SendFlags::NONE)
        .is_none());

    assert!(k.retire(h));
    assert!(!k.retire(h));
    assert!(k
        .send(Handle::NONE, h, MessageType::TEXT, 0, Bytes::new(), SendFlags::NONE)
        .is_none());
    assert_eq!(k.stats().undeliverable, 1);
}

#[test]
fn test_alloc_session_replaces_session() {
    let k = kernel();
    let received = inbox();
    let dest = k.spawn("recorder", recorder(&received), "").unwrap();
    let source = k.spawn("nop", service_fn(|_, _| {}), "").unwrap();

    let flags = SendFlags {
        dont_copy: false,
        alloc_session: true,
    };
    let first = k
        .send(source, dest, MessageType::TEXT, 99, Bytes::new(), flags)
        .unwrap();
    let second = k
        .send(source, dest, MessageType::TEXT, 99, Bytes::new(), flags)
        .unwrap();
    assert_eq!((first, second), (1, 2));

    k.run_until_idle();
    let sessions: Vec<i32> = received.lock().iter().map(|r| r.session).collect();
    assert_eq!(sessions, vec![1, 2]);
}

#[test]
fn test_alloc_session_for_null_source_is_undeliverable() {
    let k = kernel();
    let received = inbox();
    let dest = k.spawn("recorder", recorder(&received), "").unwrap();
    let gone = k.spawn("gone", service_fn(|_, _| {}), "").unwrap();
    assert!(k.retire(gone));

    let flags = SendFlags {
        dont_copy: false,
        alloc_session: true,
    };
    for source in [Handle::NONE, gone] {
        let sent = k.send(source, dest, MessageType::TEXT, 5, Bytes::from_static(b"x"), flags);
        assert_eq!(sent, None);
    }
    k.run_until_idle();

    assert!(received.lock().is_empty());
    let stats = k.stats();
    assert_eq!(stats.undeliverable, 2);
    assert_eq!(stats.enqueued, 0);
}

#[test]
fn test_zero_delay_timeout_is_queued_before_return() {
    let k = kernel();
    let received = inbox();
    let h = k.spawn("recorder", recorder(&received), "").unwrap();
    k.run_until_idle();

    assert_eq!(k.timeout(h, 0, 7), Some(7));
    assert_eq!(k.service_info(h).unwrap().mailbox_len, 1);

    k.run_until_idle();
    assert_eq!(
        received.lock().as_slice(),
        &[Received {
            source: Handle::NONE,
            session: 7,
            kind: MessageType::RESPONSE,
            payload: Vec::new(),
        }]
    );
}

#[test]
fn test_timeout_fires_after_ticks() {
    let k = kernel();
    let received = inbox();
    let h = k.spawn("recorder", recorder(&received), "").unwrap();

    k.timeout(h, 3, 11).unwrap();
    k.advance_timers(2);
    k.run_until_idle();
    assert!(received.lock().is_empty());

    k.advance_timers(1);
    k.run_until_idle();
    let got = received.lock();
    assert_eq!(got.len(), 1);
    assert_eq!((got[0].kind, got[0].session), (MessageType::RESPONSE, 11));
}

#[test]
fn test_retire_drops_queued_messages_with_error_replies() {
    let k = kernel();
    let replies = inbox();
    let client = k.spawn("client", recorder(&replies), "").unwrap();
    let target = k.spawn("target", service_fn(|_, _| {}), "").unwrap();

    for session in 1..=3 {
        k.send(client, target, MessageType::TEXT, session, Bytes::from_static(b"x"), SendFlags::NONE)
            .unwrap();
    }
    assert!(k.retire(target));
    assert!(!k.is_live(target));
    assert!(k.service_info(target).is_none());

    k.run_until_idle();

    let got = replies.lock();
    assert_eq!(got.len(), 3);
    for (reply, session) in got.iter().zip(1..=3) {
        assert_eq!(reply.kind, MessageType::ERROR);
        assert_eq!(reply.source, target);
        assert_eq!(reply.session, session);
    }
    let stats = k.stats();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.enqueued, stats.settled());
}

#[test]
fn test_exit_mid_batch_drops_rest_with_error_replies() {
    let k = kernel();
    let replies = inbox();
    let client = k.spawn("client", recorder(&replies), "").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let target = k
        .spawn(
            "target",
            service_fn(move |ctx, _msg| {
                counter.fetch_add(1, Ordering::Relaxed);
                ctx.exit();
            }),
            "",
        )
        .unwrap();
    k.run_until_idle();

    for session in 1..=4 {
        k.send(client, target, MessageType::TEXT, session, Bytes::from_static(b"x"), SendFlags::NONE)
            .unwrap();
    }
    // Weight 0 sizes the batch to the whole queue.
    let monitor = WorkerMonitor::new();
    while k.dispatch_next(&monitor, 0) {}

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert!(!k.is_live(target));
    let got = replies.lock();
    let sessions: Vec<i32> = got.iter().map(|r| r.session).collect();
    assert_eq!(sessions, vec![2, 3, 4]);
    assert!(got
        .iter()
        .all(|r| r.kind == MessageType::ERROR && r.source == target));
    let stats = k.stats();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.enqueued, stats.settled());
}

#[test]
fn test_forward_preserves_source_and_session() {
    let k = kernel();
    let received = inbox();
    let sink = k.spawn("sink", recorder(&received), "").unwrap();
    let relay = k
        .spawn("relay", service_fn(move |ctx, _msg| ctx.forward(sink)), "")
        .unwrap();
    let origin = k.spawn("origin", service_fn(|_, _| {}), "").unwrap();

    k.send(origin, relay, MessageType::CLIENT, 42, Bytes::from_static(b"data"), SendFlags::NONE)
        .unwrap();
    k.run_until_idle();

    assert_eq!(
        received.lock().as_slice(),
        &[Received {
            source: origin,
            session: 42,
            kind: MessageType::CLIENT,
            payload: b"data".to_vec(),
        }]
    );
    assert_eq!(k.stats().forwarded, 1);
}

#[test]
fn test_forward_after_retain_is_refused() {
    let k = kernel();
    let received = inbox();
    let kept = Arc::new(Mutex::new(Vec::<Bytes>::new()));
    let sink = k.spawn("sink", recorder(&received), "").unwrap();
    let store = Arc::clone(&kept);
    let relay = k
        .spawn(
            "relay",
            service_fn(move |ctx, msg| {
                store.lock().push(msg.retain());
                ctx.forward(sink);
            }),
            "",
        )
        .unwrap();

    k.send(Handle::NONE, relay, MessageType::CLIENT, 1, Bytes::from_static(b"data"), SendFlags::NONE)
        .unwrap();
    k.run_until_idle();

    assert!(received.lock().is_empty());
    assert_eq!(kept.lock().as_slice(), &[Bytes::from_static(b"data")]);
    let stats = k.stats();
    assert_eq!((stats.retained, stats.forwarded, stats.consumed), (1, 0, 0));
    assert_eq!(stats.enqueued, stats.settled());
}

#[test]
fn test_panicking_callback_drops_message_and_service_survives() {
    let k = kernel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let h = k
        .spawn(
            "fragile",
            service_fn(move |_ctx, msg| {
                counter.fetch_add(1, Ordering::SeqCst);
                if msg.payload() == b"boom" {
                    panic!("boom");
                }
            }),
            "",
        )
        .unwrap();

    for payload in [&b"boom"[..], b"ok"] {
        k.send(Handle::NONE, h, MessageType::TEXT, 0, Bytes::copy_from_slice(payload), SendFlags::NONE)
            .unwrap();
    }
    k.run_until_idle();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(k.is_live(h));
    let stats = k.stats();
    assert_eq!((stats.dropped, stats.consumed), (1, 1));
}

struct FailingInit;

impl Service for FailingInit {
    fn init(&mut self, _ctx: &mut Context<'_>, args: &str) -> skiff_core::Result<()> {
        Err(skiff_core::Error::validation(format!("bad args: {}", args)))
    }

    fn handle(&mut self, _ctx: &mut Context<'_>, _msg: &mut Message) {}
}

#[test]
fn test_failed_init_retires_handle() {
    let k = kernel();
    k.register_module("failing", || Box::new(FailingInit)).unwrap();
    assert!(k.launch("failing", "x").is_none());
    assert!(k.launch("missing", "").is_none());
    assert_eq!(k.service_count(), 0);
}

/// Sends to itself during `init`; the message must survive the launch.
struct EarlyBird {
    seen: Inbox,
}

impl Service for EarlyBird {
    fn init(&mut self, ctx: &mut Context<'_>, _args: &str) -> skiff_core::Result<()> {
        ctx.send(ctx.handle(), MessageType::TEXT, 5, b"hello");
        Ok(())
    }

    fn handle(&mut self, _ctx: &mut Context<'_>, msg: &mut Message) {
        self.seen.lock().push(Received {
            source: msg.source,
            session: msg.session,
            kind: msg.kind,
            payload: msg.payload().to_vec(),
        });
    }
}

#[test]
fn test_messages_sent_during_init_are_kept() {
    let k = kernel();
    let seen = inbox();
    let h = k
        .spawn("early", Box::new(EarlyBird { seen: Arc::clone(&seen) }), "")
        .unwrap();
    k.run_until_idle();
    let got = seen.lock();
    assert_eq!(got.len(), 1);
    assert_eq!((got[0].source, got[0].session), (h, 5));
}

#[test]
fn test_exit_watcher_hears_about_retirements() {
    let k = kernel();
    let notices = inbox();
    let watcher = k.spawn("watcher", recorder(&notices), "").unwrap();
    let victim = k.spawn("victim", service_fn(|_, _| {}), "").unwrap();

    k.command(watcher, Command::Monitor(Some(Target::Handle(watcher))))
        .unwrap();
    assert_eq!(
        k.command(victim, Command::Monitor(None)).unwrap(),
        Some(watcher.to_string())
    );
    k.command(watcher, Command::Kill(Target::Handle(victim)))
        .unwrap();
    k.run_until_idle();

    let got = notices.lock();
    assert_eq!(got.len(), 1);
    assert_eq!((got[0].kind, got[0].source), (MessageType::SYSTEM, victim));
}

#[test]
fn test_text_commands() {
    let mut config = Config::default();
    config.env.insert("preset".to_string(), "1".to_string());
    let k = Kernel::new(config).unwrap();
    let h = k.spawn("svc", service_fn(|_, _| {}), "").unwrap();
    let run = |text: &str| k.command(h, text.parse::<Command>().unwrap());

    assert_eq!(run("REG").unwrap(), Some(h.to_string()));
    assert_eq!(run("REG .svc").unwrap(), Some(".svc".to_string()));
    assert!(run("REG .svc").is_err());
    assert_eq!(run("QUERY .svc").unwrap(), Some(h.to_string()));
    assert!(run("QUERY .nobody").is_err());
    assert_eq!(
        run(&format!("NAME .alias {}", h)).unwrap(),
        Some(".alias".to_string())
    );
    assert_eq!(k.query_name(".alias"), Some(h));

    assert_eq!(run("GETENV preset").unwrap(), Some("1".to_string()));
    assert_eq!(run("GETENV unset").unwrap(), None);
    run("SETENV fresh yes").unwrap();
    assert_eq!(run("GETENV fresh").unwrap(), Some("yes".to_string()));
    assert!(run("SETENV fresh again").is_err());

    let session: i32 = run("TIMEOUT 0").unwrap().unwrap().parse().unwrap();
    assert!(session > 0);
    assert_eq!(run("STAT mqlen").unwrap(), Some("1".to_string()));
    k.run_until_idle();
    assert_eq!(run("STAT message").unwrap(), Some("1".to_string()));
    assert!(run("STARTTIME").unwrap().unwrap().parse::<i64>().unwrap() > 0);
    assert!(run("NOW").unwrap().unwrap().parse::<u64>().is_ok());

    let launched: Handle = run("LAUNCH logger .log2").unwrap().unwrap().parse().unwrap();
    assert_eq!(k.query_name(".log2"), Some(launched));
    run(&format!("KILL {}", launched)).unwrap();
    assert!(!k.is_live(launched));
    assert!(run(&format!("KILL {}", launched)).is_err());

    run("LOGON .svc").unwrap();
    run("LOGOFF .svc").unwrap();
    assert!(run(&format!("SIGNAL {} 1", h)).is_err());
}

#[test]
fn test_abort_retires_everything() {
    let k = kernel();
    for _ in 0..4 {
        k.spawn("nop", service_fn(|_, _| {}), "").unwrap();
    }
    let h = k.services()[0];
    k.command(h, Command::Abort).unwrap();
    assert_eq!(k.service_count(), 0);
}

#[test]
fn test_stuck_dispatch_marks_service_endless() {
    let k = kernel();
    let stuck = k.spawn("stuck", service_fn(|_, _| {}), "").unwrap();
    let monitor = Arc::new(WorkerMonitor::new());
    let monitors = vec![Arc::clone(&monitor)];

    monitor.trigger(Handle::NONE, stuck);
    assert!(k.check_workers(&monitors).is_empty());
    let reports = k.check_workers(&monitors);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].destination, stuck);

    assert_eq!(k.command(stuck, Command::Stat(StatKey::Endless)).unwrap(), Some("1".to_string()));
    assert_eq!(k.command(stuck, Command::Stat(StatKey::Endless)).unwrap(), Some("0".to_string()));
}

#[test]
fn test_registry_grows_past_initial_slots() {
    let k = kernel();
    let handles: Vec<Handle> = (0..100)
        .map(|_| k.spawn("nop", service_fn(|_, _| {}), "").unwrap())
        .collect();
    let mut unique = handles.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 100);
    assert!(handles.iter().all(|h| k.is_live(*h)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every accepted message leaves through exactly one disposition.
    #[test]
    fn prop_every_message_settles_once(
        choices in proptest::collection::vec(0u8..5, 1..200),
        retire_after in proptest::option::of(0usize..200),
    ) {
        let k = kernel();
        let kept = Arc::new(Mutex::new(Vec::<Bytes>::new()));
        let consumed_by_worker = Arc::new(AtomicUsize::new(0));
        let seen = inbox();
        let sink = k.spawn("sink", recorder(&seen), "").unwrap();
        let store = Arc::clone(&kept);
        let plain = Arc::clone(&consumed_by_worker);
        let worker = k
            .spawn(
                "worker",
                service_fn(move |ctx, msg| match msg.payload().first().copied() {
                    Some(1) => store.lock().push(msg.retain()),
                    Some(2) => ctx.forward(sink),
                    Some(3) => {
                        ctx.send(sink, MessageType::TEXT, 0, b"side");
                        plain.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(4) => {
                        store.lock().push(msg.retain());
                        ctx.forward(sink);
                    }
                    _ => {
                        plain.fetch_add(1, Ordering::Relaxed);
                    }
                }),
                "",
            )
            .unwrap();

        for (i, choice) in choices.iter().enumerate() {
            if retire_after == Some(i) {
                k.retire(worker);
            }
            k.send(sink, worker, MessageType::TEXT, i as i32, Bytes::copy_from_slice(&[*choice]), SendFlags::NONE);
        }
        k.run_until_idle();

        let stats = k.stats();
        let seen = seen.lock();
        let forwarded = seen.iter().filter(|r| r.payload == [2u8]).count();
        // Only intact forwards and side sends arrive as TEXT; a retained
        // payload is never forwarded.
        for r in seen.iter().filter(|r| r.kind == MessageType::TEXT) {
            prop_assert!(r.payload == [2u8] || r.payload == b"side", "unexpected {:?}", r);
        }
        prop_assert_eq!(stats.enqueued, stats.settled());
        prop_assert_eq!(stats.retained as usize, kept.lock().len());
        prop_assert!(kept.lock().iter().all(|payload| !payload.is_empty()));
        prop_assert_eq!(stats.forwarded as usize, forwarded);
        prop_assert_eq!(
            stats.consumed as usize,
            consumed_by_worker.load(Ordering::Relaxed) + seen.len()
        );
    }
}

#[test]
fn test_threaded_ping_pong_settles() {
    let mut config = Config::default();
    config.kernel.workers = 4;
    config.monitor.enabled = false;
    let kernel = Arc::new(Kernel::new(config).unwrap());
    let handle = KernelHandle::start(Arc::clone(&kernel)).unwrap();

    const ROUNDS: usize = 2_000;
    let hits = Arc::new(AtomicUsize::new(0));
    let make = |hits: Arc<AtomicUsize>| {
        service_fn(move |ctx, msg| {
            if hits.fetch_add(1, Ordering::SeqCst) + 1 < ROUNDS {
                ctx.send(msg.source, MessageType::TEXT, msg.session, msg.payload());
            }
        })
    };
    let ping = kernel.spawn("ping", make(Arc::clone(&hits)), "").unwrap();
    let pong = kernel.spawn("pong", make(Arc::clone(&hits)), "").unwrap();
    kernel
        .send(ping, pong, MessageType::TEXT, 1, Bytes::from_static(b"ball"), SendFlags::NONE)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = kernel.stats();
        if hits.load(Ordering::SeqCst) >= ROUNDS && stats.enqueued == stats.settled() {
            break;
        }
        assert!(Instant::now() < deadline, "ping-pong did not finish: {:?}", stats);
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.shutdown();
    assert_eq!(hits.load(Ordering::SeqCst), ROUNDS);
}

#[test]
fn test_kernel_stops_when_last_service_exits() {
    let mut config = Config::default();
    config.kernel.workers = 2;
    config.timer.tick = Duration::from_millis(1);
    let kernel = Arc::new(Kernel::new(config).unwrap());
    let handle = KernelHandle::start(Arc::clone(&kernel)).unwrap();

    struct Sleeper;
    impl Service for Sleeper {
        fn init(&mut self, ctx: &mut Context<'_>, _args: &str) -> skiff_core::Result<()> {
            ctx.timeout(5);
            Ok(())
        }
        fn handle(&mut self, ctx: &mut Context<'_>, msg: &mut Message) {
            if msg.kind == MessageType::RESPONSE {
                ctx.exit();
            }
        }
    }
    kernel.spawn("sleeper", Box::new(Sleeper), "").unwrap();

    let started = Instant::now();
    handle.wait();
    assert!(kernel.is_shutting_down());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(kernel.service_count(), 0);
}
