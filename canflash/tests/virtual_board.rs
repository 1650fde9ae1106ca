//! End-to-end runs of the control loop against the simulated bootloader.

use {
    canflash::{
        BoardVersion, CanFrame, ErrorKind, Event, FirmwareImage, LinkParams, LinkState, Operation,
        Phase, Request, Runner, TimeoutPolicy, UpgradeConfig, VirtualBoard, transport::BoardFaults,
    },
    std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, Instant},
    },
};

fn fast_timeouts() -> TimeoutPolicy {
    TimeoutPolicy {
        receive: Duration::from_millis(50),
        erase: Duration::from_millis(50),
        upload: Duration::from_millis(50),
        confirm: Duration::from_millis(50),
    }
}

fn connected(board: &VirtualBoard, config: UpgradeConfig) -> Runner<VirtualBoard> {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
    let mut runner = Runner::new(board.clone(), config).unwrap();
    let event = runner.execute(
        Request::Connect(LinkParams::new("virtual", "vcan0", 250)),
        |_| {},
    );
    assert!(matches!(event, Event::Connected { .. }), "{event:?}");
    runner
}

fn image(len: usize) -> FirmwareImage {
    FirmwareImage::from(
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(7))
            .collect::<Vec<_>>(),
    )
}

#[test]
fn flash_writes_the_whole_image() {
    let board = VirtualBoard::new();
    let mut runner = connected(&board, UpgradeConfig::default().with_chunk_size(256));
    let img = image(5000);

    let mut progress = Vec::new();
    let done = runner.execute(
        Request::Flash {
            image: img.clone(),
            test_mode: false,
        },
        |event| {
            if let Event::UploadProgress { offset, .. } = event {
                progress.push(*offset);
            }
        },
    );

    assert_eq!(done, Event::UpgradeCompleted {
        total: 5000,
        test_mode: false
    });
    assert_eq!(board.image(), img.as_bytes());
    assert_eq!(board.confirmed(), Some(false));
    assert_eq!(progress.len(), 5000usize.div_ceil(256));
    assert_eq!(progress.last(), Some(&5000));
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(runner.engine().phase(), Phase::Completed);
}

#[test]
fn test_mode_reaches_the_board() {
    let board = VirtualBoard::new();
    let mut runner = connected(&board, UpgradeConfig::default());
    let done = runner.execute(
        Request::Flash {
            image: image(100),
            test_mode: true,
        },
        |_| {},
    );
    assert!(matches!(done, Event::UpgradeCompleted { test_mode: true, .. }));
    assert_eq!(board.confirmed(), Some(true));
}

#[test]
fn board_write_error_is_reported_with_offset() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        write_error: Some((2048, 3)),
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default().with_chunk_size(256));
    let done = runner.execute(
        Request::Flash {
            image: image(4096),
            test_mode: false,
        },
        |_| {},
    );

    let record = done.error().unwrap();
    assert_eq!(record.kind, ErrorKind::FirmwareUploadError {
        code: 3,
        offset: 2048
    });
    assert_eq!(board.image().len(), 2048 + 64);
    assert_eq!(board.confirmed(), None);
}

#[test]
fn silent_board_times_out_during_erase() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        silent: true,
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default().with_timeouts(fast_timeouts()));

    let started = Instant::now();
    let done = runner.execute(
        Request::Flash {
            image: image(64),
            test_mode: false,
        },
        |_| {},
    );
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(done.error().unwrap().kind, ErrorKind::FlashEraseTimeout);
    assert_eq!(board.erase_count(), 1);
}

#[test]
fn stalled_upload_times_out() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        stall_at: Some(128),
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default().with_timeouts(fast_timeouts()));
    let done = runner.execute(
        Request::Flash {
            image: image(512),
            test_mode: false,
        },
        |_| {},
    );
    assert_eq!(done.error().unwrap().kind, ErrorKind::FirmwareUploadTimeout);
    assert_eq!(runner.engine().phase(), Phase::Failed);
}

#[test]
fn rejected_confirm_keeps_the_code() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        confirm_error: Some(4),
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default());
    let done = runner.execute(
        Request::Flash {
            image: image(64),
            test_mode: false,
        },
        |_| {},
    );
    assert_eq!(done.error().unwrap().kind, ErrorKind::ConfirmRejected {
        code: 4,
        value: 0
    });
}

#[test]
fn version_and_reboot() {
    let version = BoardVersion {
        major: 3,
        minor: 1,
        patch: 4,
    };
    let board = VirtualBoard::new().with_version(version);
    let mut runner = connected(&board, UpgradeConfig::default());

    assert_eq!(
        runner.execute(Request::GetVersion, |_| {}),
        Event::VersionReceived { version }
    );
    assert_eq!(runner.execute(Request::Reboot, |_| {}), Event::RebootSent);
    assert_eq!(board.reboot_count(), 1);
    assert_eq!(runner.engine().link(), LinkState::Connected);
}

#[test]
fn version_query_times_out_on_silent_board() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        silent: true,
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default().with_timeouts(fast_timeouts()));
    let done = runner.execute(Request::GetVersion, |_| {});
    let record = done.error().unwrap();
    assert_eq!(record.operation, Operation::GetVersion);
    assert_eq!(record.kind, ErrorKind::ReceiveTimeout);
    assert_eq!(runner.engine().link(), LinkState::Connected);
}

#[test]
fn version_timeout_fires_while_the_bus_chatters() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        silent: true,
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default().with_timeouts(fast_timeouts()));

    let stop = Arc::new(AtomicBool::new(false));
    let chatter = {
        let stop = Arc::clone(&stop);
        let sender = runner.sender();
        let frame = CanFrame::new(0x7DF, &[0x02, 0x3E, 0x00]).unwrap();
        std::thread::spawn(move || {
            let started = Instant::now();
            while !stop.load(Ordering::Relaxed) && started.elapsed() < Duration::from_secs(2) {
                for _ in 0..256 {
                    sender.frame_received(frame);
                }
                std::thread::yield_now();
            }
        })
    };

    let started = Instant::now();
    let done = runner.execute(Request::GetVersion, |_| {});
    let elapsed = started.elapsed();
    stop.store(true, Ordering::Relaxed);
    chatter.join().unwrap();

    assert_eq!(done.error().unwrap().kind, ErrorKind::ReceiveTimeout);
    assert!(elapsed < Duration::from_secs(1), "timeout took {elapsed:?}");
}

#[test]
fn pending_link_comes_up() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        open_pending: true,
        ..Default::default()
    });
    let runner = connected(&board, UpgradeConfig::default());
    assert!(board.is_open());
    assert!(runner.engine().armed_timer().is_none());
}

#[test]
fn refused_frames_fail_the_flash() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        refuse_send_after: Some(5),
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default());
    let done = runner.execute(
        Request::Flash {
            image: image(256),
            test_mode: false,
        },
        |_| {},
    );
    assert_eq!(done.error().unwrap().kind, ErrorKind::SendFailure);
}

#[test]
fn link_error_from_another_thread_ends_the_flash() {
    let board = VirtualBoard::new().with_faults(BoardFaults {
        silent: true,
        ..Default::default()
    });
    let mut runner = connected(&board, UpgradeConfig::default());
    let sender = runner.sender();
    let injector = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        sender.link_error("bus off");
    });

    let mut lost = false;
    let done = runner.execute(
        Request::Flash {
            image: image(64),
            test_mode: false,
        },
        |event| lost |= matches!(event, Event::ConnectionLost { .. }),
    );
    injector.join().unwrap();

    assert!(matches!(
        done.error().map(|r| &r.kind),
        Some(ErrorKind::CanError { .. })
    ));
    // ConnectionLost follows the terminal failure.
    assert!(!lost);
    assert!(matches!(
        runner.engine_mut().poll_event(),
        Some(Event::ConnectionLost { .. })
    ));
    assert_eq!(runner.engine().link(), LinkState::Disconnected);
    assert!(!board.is_open());
}
