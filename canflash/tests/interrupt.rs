//! Interrupt handling lives in its own test binary: the checker is process
//! global and can only be registered once.

use {
    canflash::{
        ErrorKind, Event, FirmwareImage, LinkParams, LinkState, Operation, Request, Runner,
        UpgradeConfig, VirtualBoard, is_interrupted_requested, set_interrupt_checker,
        transport::BoardFaults,
    },
    std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

#[test]
fn interrupt_cancels_pending_flash_and_disconnects() {
    let flag = Arc::new(AtomicBool::new(false));
    let checker = Arc::clone(&flag);
    set_interrupt_checker(move || checker.load(Ordering::Relaxed));
    assert!(!is_interrupted_requested());

    let board = VirtualBoard::new().with_faults(BoardFaults {
        silent: true,
        ..Default::default()
    });
    let mut runner = Runner::new(board.clone(), UpgradeConfig::default()).unwrap();
    runner.execute(Request::Connect(LinkParams::default()), |_| {});

    flag.store(true, Ordering::Relaxed);
    assert!(is_interrupted_requested());

    let mut seen = Vec::new();
    let done = runner.execute(
        Request::Flash {
            image: FirmwareImage::from(vec![0u8; 64]),
            test_mode: false,
        },
        |event| seen.push(event.clone()),
    );

    let record = done.error().unwrap();
    assert_eq!(record.operation, Operation::Flash);
    assert_eq!(record.kind, ErrorKind::Cancelled);
    assert!(matches!(seen.first(), Some(Event::EraseStarted { .. })));
    assert_eq!(runner.engine().link(), LinkState::Disconnected);
    assert!(!board.is_open());
}
