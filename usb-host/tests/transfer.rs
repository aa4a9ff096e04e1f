mod common;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use common::*;
use usbh::*;

const TIMEOUT: Duration = Duration::from_secs(5);

fn submits(calls: &[Call], ep: u8) -> Vec<Token> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::Submit { ep: e, token, .. } if *e == ep => Some(*token),
            _ => None,
        })
        .collect()
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

type Results = Arc<Mutex<Vec<Completion>>>;

fn collect(results: &Results) -> impl FnOnce(Completion) + Send + 'static {
    let results = results.clone();
    move |c| results.lock().unwrap().push(c)
}

#[test]
fn control_stages_run_in_order() {
    let (_host, dev, shared) = configured(HostConfig::default());

    shared.take_calls();
    assert_eq!(dev.get_configuration().unwrap(), 1);
    assert_eq!(
        submits(&shared.calls(), 0),
        vec![Token::Setup, Token::In, Token::Out]
    );

    shared.take_calls();
    dev.set_configuration(1).unwrap();
    assert_eq!(submits(&shared.calls(), 0), vec![Token::Setup, Token::In]);
}

#[test]
fn setup_failure_skips_data_and_status() {
    let (_host, dev, shared) = configured(HostConfig::default());

    shared.take_calls();
    shared.fail_setups.store(1, Ordering::SeqCst);
    assert_eq!(
        dev.get_configuration(),
        Err(USBError::TransferError(TransferError::Stall))
    );
    assert_eq!(submits(&shared.calls(), 0), vec![Token::Setup]);

    // The pipe is usable again right away.
    assert_eq!(dev.get_configuration().unwrap(), 1);
}

#[test]
fn sync_bulk_round_trip() {
    let (_host, dev, shared) = configured(HostConfig::default());
    let bulk_in = dev.open_bulk_in(0).unwrap();
    let bulk_out = dev.open_bulk_out(0).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(bulk_in.transfer(&mut buf, TIMEOUT).unwrap(), 64);
    assert!(buf.iter().all(|&b| b != 0 && b == buf[0]));
    assert_eq!(bulk_out.transfer(&[7; 32], TIMEOUT).unwrap(), 32);

    let calls = shared.calls();
    assert_eq!(submits(&calls, 0x81), vec![Token::In]);
    assert_eq!(submits(&calls, 0x02), vec![Token::Out]);
    assert!(calls.contains(&Call::Complete { dev: 1, ep: 0x81 }));
    assert_eq!(bulk_in.in_flight(), 0);
}

#[test]
fn timeout_aborts_and_releases_the_endpoint() {
    let (_host, dev, shared) = configured(HostConfig::default());
    let ep = dev.open_bulk_in(0).unwrap();

    shared.set_mode(Mode::Deferred);
    let mut buf = [0u8; 64];
    assert_eq!(
        ep.transfer(&mut buf, Duration::from_millis(20)),
        Err(USBError::Timeout)
    );
    assert!(shared.calls().contains(&Call::Abort { dev: 1, ep: 0x81 }));
    assert_eq!(shared.pending(), 0);

    shared.set_mode(Mode::Inline);
    assert_eq!(ep.transfer(&mut buf, TIMEOUT).unwrap(), 64);
}

#[test]
fn transfer_error_releases_the_endpoint() {
    let (_host, dev, shared) = configured(HostConfig::default());
    let ep = dev.open_bulk_in(0).unwrap();

    shared.fail_transfers.store(1, Ordering::SeqCst);
    let mut buf = [0u8; 16];
    assert_eq!(
        ep.transfer(&mut buf, TIMEOUT),
        Err(USBError::TransferError(TransferError::Stall))
    );
    assert_eq!(buf, [0; 16]);
    assert_eq!(ep.transfer(&mut buf, TIMEOUT).unwrap(), 16);
}

#[test]
fn halted_endpoint_asks_for_retry() {
    let (_host, dev, shared) = configured(HostConfig::default());
    let ep = dev.open_bulk_in(0).unwrap();

    shared.halted.store(true, Ordering::SeqCst);
    let mut buf = [0u8; 8];
    assert_eq!(ep.transfer(&mut buf, TIMEOUT), Err(USBError::Retry));
    assert!(submits(&shared.calls(), 0x81).is_empty());

    shared.halted.store(false, Ordering::SeqCst);
    dev.clear_halt(&ep).unwrap();
    assert_eq!(ep.transfer(&mut buf, TIMEOUT).unwrap(), 8);
}

#[test]
fn close_unblocks_sync_caller() {
    let (_host, dev, shared) = configured(HostConfig::default());
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);

    let res = thread::scope(|s| {
        let caller = s.spawn(|| {
            let mut buf = [0u8; 64];
            ep.transfer(&mut buf, Duration::from_secs(30))
        });
        wait_for("submission", || shared.pending() == 1);
        ep.close().unwrap();
        caller.join().unwrap()
    });

    assert!(res.unwrap_err().is_cancelled());
    assert!(!ep.is_open());
    assert_eq!(ep.in_flight(), 0);
    let mut buf = [0u8; 8];
    assert_eq!(ep.transfer(&mut buf, TIMEOUT), Err(USBError::NotOpen));

    shared.set_mode(Mode::Inline);
    ep.reset().unwrap();
    assert!(ep.is_open());
    assert_eq!(ep.transfer(&mut buf, TIMEOUT).unwrap(), 8);
}

#[test]
fn sync_transfers_on_one_endpoint_are_serialized() {
    let (_host, dev, shared) = configured(HostConfig::default());
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);
    shared.take_calls();

    let order = Mutex::new(Vec::new());
    let fills = thread::scope(|s| {
        let run = |name: &'static str| {
            let (ep, order) = (&ep, &order);
            move || {
                let mut buf = [0u8; 64];
                let n = ep.transfer(&mut buf, TIMEOUT).unwrap();
                order.lock().unwrap().push(name);
                (n, buf[0])
            }
        };
        let first = s.spawn(run("first"));
        wait_for("first submission", || shared.pending() == 1);
        let second = s.spawn(run("second"));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(submits(&shared.calls(), 0x81).len(), 1);
        assert_eq!(shared.pending(), 1);

        assert_eq!(shared.complete_all(), 1);
        let first = first.join().unwrap();
        wait_for("second submission", || shared.pending() == 1);
        assert_eq!(submits(&shared.calls(), 0x81).len(), 2);
        assert_eq!(shared.complete_all(), 1);
        (first, second.join().unwrap())
    });

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(fills.0 .0, 64);
    assert_eq!(fills.1 .0, 64);
    assert_ne!(fills.0 .1, fills.1 .1);
    assert_eq!(ep.in_flight(), 0);
}

#[test]
fn interrupt_side_only_signals_completion() {
    let (_host, dev, shared) = configured(HostConfig::default());
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);
    shared.take_calls();

    let (n, buf) = thread::scope(|s| {
        let caller = s.spawn(|| {
            let mut buf = [0u8; 32];
            let n = ep.transfer(&mut buf, TIMEOUT);
            (n, buf)
        });
        wait_for("submission", || shared.pending() == 1);
        assert_eq!(shared.complete_all(), 1);
        caller.join().unwrap()
    });

    // The data arrives through `urb_complete`, after the interrupt side
    // called nothing but `done`.
    assert_eq!(n, Ok(32));
    assert!(buf.iter().all(|&b| b != 0 && b == buf[0]));
    let calls = shared.calls();
    let submit = calls
        .iter()
        .position(|c| matches!(c, Call::Submit { ep: 0x81, .. }))
        .unwrap();
    let complete = calls
        .iter()
        .position(|c| *c == Call::Complete { dev: 1, ep: 0x81 })
        .unwrap();
    assert!(submit < complete);
}

#[test]
fn close_racing_async_submissions_leaves_nothing_in_flight() {
    let (host, dev, shared) = configured(HostConfig::default());
    let _dispatcher = host.take_dispatcher().unwrap();
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);

    let callbacks = Arc::new(AtomicUsize::new(0));
    let accepted = thread::scope(|s| {
        let submitter = s.spawn(|| {
            let mut accepted = 0;
            loop {
                let callbacks = callbacks.clone();
                match ep.submit(vec![0; 8], move |c| {
                    assert!(c.result.unwrap_err().is_cancelled());
                    callbacks.fetch_add(1, Ordering::SeqCst);
                }) {
                    Ok(()) => accepted += 1,
                    Err(USBError::NotOpen) => return accepted,
                    Err(USBError::NoMemory | USBError::Busy) => thread::yield_now(),
                    Err(e) => panic!("submit failed: {e}"),
                }
            }
        });
        wait_for("a few submissions", || shared.pending() >= 4);
        ep.close().unwrap();
        assert_eq!(ep.in_flight(), 0);
        submitter.join().unwrap()
    });

    assert!(accepted >= 4);
    assert_eq!(callbacks.load(Ordering::SeqCst), accepted);
    assert_eq!(shared.pending(), 0);
    assert_eq!(host.free_extra_urbs(), 16);
}

#[test]
fn close_cancels_every_async_transfer() {
    let (host, dev, shared) = configured(HostConfig::default());
    let dispatcher = host.take_dispatcher().unwrap();
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);

    let results = Results::default();
    for _ in 0..3 {
        ep.submit(vec![0; 32], collect(&results)).unwrap();
    }
    assert_eq!(ep.in_flight(), 3);
    assert_eq!(host.free_extra_urbs(), 16 - 2);

    ep.close().unwrap();
    assert_eq!(ep.in_flight(), 0);
    assert_eq!(host.free_extra_urbs(), 16);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);
    for c in results.iter() {
        assert!(c.result.as_ref().unwrap_err().is_cancelled());
        assert_eq!(c.buffer.len(), 32);
    }
    assert_eq!(dispatcher.dispatch_pending(), 0);
    assert_eq!(dispatcher.pushed(), 0);
}

#[test]
fn second_async_submit_uses_extra_pool() {
    let (host, dev, shared) = configured(HostConfig::default());
    let dispatcher = host.take_dispatcher().unwrap();
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);

    let results = Results::default();
    ep.submit(vec![0; 64], collect(&results)).unwrap();
    assert_eq!(host.free_extra_urbs(), 16);
    ep.submit(vec![0; 64], collect(&results)).unwrap();
    assert_eq!(host.free_extra_urbs(), 15);
    assert_eq!(ep.in_flight(), 2);

    assert_eq!(shared.complete_all(), 2);
    assert_eq!(dispatcher.dispatch_pending(), 2);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    let fills: Vec<u8> = results
        .iter()
        .map(|c| {
            assert_eq!(c.result, Ok(64));
            assert!(c.buffer.iter().all(|&b| b == c.buffer[0]));
            c.buffer[0]
        })
        .collect();
    assert_ne!(fills[0], fills[1]);
    assert_eq!(ep.in_flight(), 0);
    assert_eq!(host.free_extra_urbs(), 16);
}

#[test]
fn extra_pool_exhaustion() {
    let config = HostConfig {
        extra_urbs: 1,
        ..Default::default()
    };
    let (_host, dev, shared) = configured(config);
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);

    ep.submit(vec![0; 8], |_| {}).unwrap();
    ep.submit(vec![0; 8], |_| {}).unwrap();
    assert_eq!(ep.submit(vec![0; 8], |_| {}), Err(USBError::NoMemory));
    assert_eq!(ep.in_flight(), 2);
}

#[test]
fn completion_queue_reservations_limit_submissions() {
    let config = HostConfig {
        completion_queue_depth: 2,
        extra_urbs: 4,
        ..Default::default()
    };
    let (host, dev, shared) = configured(config);
    let dispatcher = host.take_dispatcher().unwrap();
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);

    ep.submit(vec![0; 8], |_| {}).unwrap();
    ep.submit(vec![0; 8], |_| {}).unwrap();
    assert_eq!(ep.submit(vec![0; 8], |_| {}), Err(USBError::Busy));

    shared.complete_all();
    assert_eq!(dispatcher.dispatch_pending(), 2);
    ep.submit(vec![0; 8], |_| {}).unwrap();
}

#[test]
fn flood_is_fully_dispatched() {
    const TOTAL: usize = 500;
    let (host, dev, shared) = configured(HostConfig::default());
    let dispatcher = host.take_dispatcher().unwrap();
    let ep = dev.open_bulk_in(0).unwrap();
    shared.set_mode(Mode::Deferred);

    let completed = Arc::new(AtomicUsize::new(0));
    let stop = std::sync::atomic::AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                shared.complete_all();
                thread::yield_now();
            }
        });

        for _ in 0..TOTAL {
            loop {
                let completed = completed.clone();
                match ep.submit(vec![0; 8], move |c| {
                    assert_eq!(c.result, Ok(8));
                    completed.fetch_add(1, Ordering::SeqCst);
                }) {
                    Ok(()) => break,
                    Err(USBError::NoMemory | USBError::Busy) => {
                        dispatcher.dispatch_pending();
                        thread::yield_now();
                    }
                    Err(e) => panic!("submit failed: {e}"),
                }
            }
        }
        wait_for("completions", || {
            dispatcher.dispatch_pending();
            completed.load(Ordering::SeqCst) == TOTAL
        });
        stop.store(true, Ordering::SeqCst);
    });

    assert_eq!(dispatcher.pushed(), TOTAL);
    assert_eq!(dispatcher.dispatched(), TOTAL);
    assert_eq!(ep.in_flight(), 0);
    assert_eq!(host.free_extra_urbs(), 16);
}

#[test]
fn submit_and_wait_resolves() {
    let (host, dev, _shared) = configured(HostConfig::default());
    let dispatcher = host.take_dispatcher().unwrap();
    let ep = dev.open_bulk_out(0).unwrap();

    let waiter = ep.submit_and_wait(vec![3; 48]).unwrap();
    assert_eq!(dispatcher.dispatch_pending(), 1);
    let c = spin_on::spin_on(waiter);
    assert_eq!(c.result, Ok(48));
    assert_eq!(c.buffer, vec![3; 48]);
}

#[test]
fn dispatcher_task_runs_until_host_drop() {
    let (host, dev, _shared) = configured(HostConfig::default());
    let dispatcher = host.take_dispatcher().unwrap();
    assert!(host.take_dispatcher().is_none());
    let task = thread::spawn(move || spin_on::spin_on(dispatcher.run()));

    let ep = dev.open_bulk_in(0).unwrap();
    let (tx, rx) = mpsc::channel();
    ep.submit(vec![0; 16], move |c| tx.send(c.result).unwrap())
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ok(16));

    drop(ep);
    drop(dev);
    drop(host);
    task.join().unwrap();
}

#[test]
fn isochronous_frames_are_reported() {
    let (_host, dev, _shared) = configured(HostConfig::default());
    let ep = dev.open_iso_in(0).unwrap();
    assert_eq!(ep.interval(), 1);

    let mut req = IsocRequest::new(0, &[192, 192]);
    let mut buf = vec![0u8; 384];
    assert_eq!(ep.transfer(&mut buf, &mut req, TIMEOUT).unwrap(), 384);
    assert!(req.packets.iter().all(|p| p.actual == 192 && p.error.is_none()));

    let mut short = vec![0u8; 100];
    assert_eq!(
        ep.transfer(&mut short, &mut req, TIMEOUT),
        Err(USBError::InvalidArgument)
    );
}

#[test]
fn interrupt_endpoint_interval() {
    let (_host, dev, _shared) = configured(HostConfig::default());
    let ep = dev.open_interrupt_in(0).unwrap();
    assert_eq!(ep.max_packet_size(), 8);
    assert_eq!(ep.interval(), 1 << 9);
    let mut buf = [0u8; 8];
    assert_eq!(ep.transfer(&mut buf, TIMEOUT).unwrap(), 8);
}
