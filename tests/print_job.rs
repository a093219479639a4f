use marlin_bridge::ExecutorContext;
use marlin_bridge::file_manager::FileManagerError;
use marlin_bridge::gcode::executor::Dispatch;
use marlin_bridge::objects::ObjectRegistry;
use marlin_bridge::print_job::{DRAIN_COMMAND, PrintError, PrintManager, PrintState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tempfile::TempDir;

/// Acknowledges every command from a separate task, like firmware would.
#[derive(Default)]
struct AutoOk {
    sent: Mutex<Vec<String>>,
}

impl AutoOk {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl Dispatch for AutoOk {
    fn dispatch(&self, context: &Arc<ExecutorContext>, line: &str) {
        self.sent.lock().unwrap().push(line.to_string());
        let context = context.clone();
        tokio::spawn(async move { context.complete(Some("ok")) });
    }
}

/// Holds every command until `release`, then acknowledges like `AutoOk`.
#[derive(Default)]
struct ManualAck {
    auto: AtomicBool,
    sent: Mutex<Vec<String>>,
    held: Mutex<Vec<Arc<ExecutorContext>>>,
}

impl ManualAck {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap();
        self.auto.store(true, Ordering::SeqCst);
        for context in held.drain(..) {
            tokio::spawn(async move { context.complete(Some("ok")) });
        }
    }
}

impl Dispatch for ManualAck {
    fn dispatch(&self, context: &Arc<ExecutorContext>, line: &str) {
        self.sent.lock().unwrap().push(line.to_string());
        let mut held = self.held.lock().unwrap();
        if self.auto.load(Ordering::SeqCst) {
            let context = context.clone();
            tokio::spawn(async move { context.complete(Some("ok")) });
        } else {
            held.push(context.clone());
        }
    }
}

struct Fixture {
    dir: TempDir,
    firmware: Arc<AutoOk>,
    main: Arc<ExecutorContext>,
    objects: Arc<ObjectRegistry>,
    manager: Arc<PrintManager>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let firmware = Arc::new(AutoOk::default());
    let dispatcher: Weak<dyn Dispatch> = Arc::downgrade(&firmware) as Weak<dyn Dispatch>;
    let main = ExecutorContext::new("main", dispatcher);
    let objects = Arc::new(ObjectRegistry::new());
    let manager = PrintManager::new(main.clone(), objects.clone(), dir.path());
    manager.register_objects();
    Fixture { dir, firmware, main, objects, manager }
}

fn write_file(fixture: &Fixture, name: &str, contents: &str) {
    std::fs::write(fixture.dir.path().join(name), contents).unwrap();
}

async fn wait_for_state(manager: &PrintManager, state: PrintState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("print never reached {state}, stuck in {}", manager.state()));
}

fn long_file(lines: usize) -> String {
    (0..lines).map(|i| format!("G1 X{} Y{}\n", i % 200, i % 100)).collect()
}

#[tokio::test]
async fn streams_file_and_completes() {
    let f = fixture();
    write_file(&f, "cube.gcode", "; header\nG28\n\nG1 X10 ; move\nM104 S200\n");
    f.manager.select_file("cube.gcode").await.unwrap();
    f.manager.start().unwrap();
    wait_for_state(&f.manager, PrintState::Complete).await;

    assert_eq!(f.firmware.sent(), ["G28", "G1 X10", "M104 S200", DRAIN_COMMAND]);
    let job = f.manager.current_job().unwrap();
    assert_eq!(job.file_position, job.file_size);
    assert_eq!(job.progress(), 1.0);

    let stats = f.objects.query("print_stats").unwrap();
    assert_eq!(stats["state"], "complete");
    assert_eq!(stats["filename"], "cube.gcode");
    let sdcard = f.objects.query("virtual_sdcard").unwrap();
    assert_eq!(sdcard["progress"], 1.0);
    assert_eq!(sdcard["is_active"], false);
}

#[tokio::test]
async fn missing_file_leaves_state_untouched() {
    let f = fixture();
    let err = f.manager.select_file("nope.gcode").await.unwrap_err();
    assert!(matches!(err, PrintError::File(FileManagerError::NotFound(_))));
    assert_eq!(f.manager.state(), PrintState::Standby);
    assert!(f.manager.current_job().is_none());
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let f = fixture();
    write_file(&f, "notes.txt", "G28\n");
    let err = f.manager.select_file("notes.txt").await.unwrap_err();
    assert!(matches!(err, PrintError::File(FileManagerError::UnsupportedExtension(_))));
}

#[tokio::test]
async fn start_without_file_fails() {
    let f = fixture();
    assert!(matches!(f.manager.start(), Err(PrintError::NoFileSelected)));
}

#[tokio::test]
async fn restarting_a_finished_print_resets_progress() {
    let f = fixture();
    write_file(&f, "part.gcode", "G28\nG1 X5\n");
    f.manager.select_file("gcodes/part.gcode").await.unwrap();
    f.manager.start().unwrap();
    wait_for_state(&f.manager, PrintState::Complete).await;
    let first_id = f.manager.current_job().unwrap().id;

    f.manager.start().unwrap();
    assert_eq!(f.manager.state(), PrintState::Printing);
    assert_eq!(f.manager.current_job().unwrap().file_position, 0);
    wait_for_state(&f.manager, PrintState::Complete).await;
    assert_eq!(f.manager.current_job().unwrap().id, first_id);
    assert_eq!(f.firmware.sent().iter().filter(|l| *l == "G28").count(), 2);
}

#[tokio::test]
async fn pause_holds_streaming_until_resume() {
    let f = fixture();
    write_file(&f, "long.gcode", &long_file(200));
    f.manager.select_file("long.gcode").await.unwrap();
    f.manager.start().unwrap();
    f.manager.pause(&f.main).await.unwrap();
    assert_eq!(f.manager.state(), PrintState::Paused);
    assert_eq!(f.objects.query("pause_resume").unwrap()["is_paused"], true);

    let held = f.manager.current_job().unwrap().file_position;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.manager.current_job().unwrap().file_position, held);
    assert!(f.firmware.sent().contains(&DRAIN_COMMAND.to_string()));

    f.manager.resume().unwrap();
    wait_for_state(&f.manager, PrintState::Complete).await;
    let job = f.manager.current_job().unwrap();
    assert_eq!(job.file_position, job.file_size);
}

#[tokio::test]
async fn cancel_from_pause_stops_the_stream() {
    let f = fixture();
    write_file(&f, "long.gcode", &long_file(500));
    f.manager.select_file("long.gcode").await.unwrap();
    f.manager.start().unwrap();
    f.manager.pause(&f.main).await.unwrap();
    f.manager.cancel(&f.main).await.unwrap();
    assert_eq!(f.manager.state(), PrintState::Cancelled);

    let sent = f.firmware.sent().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.firmware.sent().len(), sent);
    assert!(f.manager.current_job().unwrap().progress() < 1.0);
    assert_eq!(f.objects.query("print_stats").unwrap()["state"], "cancelled");
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let f = fixture();
    assert!(matches!(
        f.manager.pause(&f.main).await,
        Err(PrintError::InvalidTransition { action: "pause", state: PrintState::Standby })
    ));
    assert!(matches!(
        f.manager.resume(),
        Err(PrintError::InvalidTransition { action: "resume", .. })
    ));
    assert!(matches!(
        f.manager.cancel(&f.main).await,
        Err(PrintError::InvalidTransition { action: "cancel", .. })
    ));

    write_file(&f, "long.gcode", &long_file(100));
    write_file(&f, "other.gcode", "G28\n");
    f.manager.select_file("long.gcode").await.unwrap();
    f.manager.start().unwrap();
    f.manager.pause(&f.main).await.unwrap();
    assert!(matches!(f.manager.select_file("other.gcode").await, Err(PrintError::AlreadyPrinting(PrintState::Paused))));
    assert!(matches!(f.manager.reset_file(), Err(PrintError::AlreadyPrinting(_))));
    assert!(matches!(f.manager.start(), Err(PrintError::InvalidTransition { action: "start", .. })));
    f.manager.cancel(&f.main).await.unwrap();

    f.manager.reset_file().unwrap();
    assert!(f.manager.current_job().is_none());
    assert_eq!(f.manager.state(), PrintState::Standby);
}

#[tokio::test]
async fn teardown_cancels_an_active_print() {
    let f = fixture();
    write_file(&f, "long.gcode", &long_file(100));
    f.manager.select_file("long.gcode").await.unwrap();
    f.manager.start().unwrap();
    f.manager.pause(&f.main).await.unwrap();
    f.manager.teardown();
    assert_eq!(f.manager.state(), PrintState::Cancelled);
    assert_eq!(f.objects.query("print_stats").unwrap()["message"], "Lost connection to printer");
}

#[tokio::test]
async fn line_acked_after_cancel_does_not_advance_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let contents = "G28\nG1 X1\nG1 X2\n";
    std::fs::write(dir.path().join("part.gcode"), contents).unwrap();
    let firmware = Arc::new(ManualAck::default());
    let dispatcher: Weak<dyn Dispatch> = Arc::downgrade(&firmware) as Weak<dyn Dispatch>;
    let main = ExecutorContext::new("main", dispatcher.clone());
    let api = ExecutorContext::new("api", dispatcher);
    let manager = PrintManager::new(main.clone(), Arc::new(ObjectRegistry::new()), dir.path());

    manager.select_file("part.gcode").await.unwrap();
    manager.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !firmware.sent().contains(&"G28".to_string()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("G28 never reached the firmware");

    // G28 is still unacknowledged when the run is cancelled and replaced.
    let cancelling = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.cancel(&api).await })
    };
    wait_for_state(&manager, PrintState::Cancelled).await;
    manager.start().unwrap();
    firmware.release();

    cancelling.await.unwrap().unwrap();
    wait_for_state(&manager, PrintState::Complete).await;
    let job = manager.current_job().unwrap();
    assert_eq!(job.file_size, contents.len() as u64);
    assert_eq!(job.file_position, job.file_size);
    assert_eq!(job.progress(), 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_racing_the_end_of_file_never_strands_the_job() {
    let f = fixture();
    write_file(&f, "short.gcode", "G28\n");
    f.manager.select_file("short.gcode").await.unwrap();
    for round in 0..100u64 {
        f.manager.start().unwrap();
        tokio::time::sleep(Duration::from_micros(round % 7 * 50)).await;
        match f.manager.pause(&f.main).await {
            Ok(()) => {
                assert_eq!(f.manager.state(), PrintState::Paused);
                f.manager.resume().unwrap();
            }
            Err(PrintError::InvalidTransition { action: "pause", state }) => {
                assert_eq!(state, PrintState::Complete);
            }
            Err(e) => panic!("unexpected pause failure: {e}"),
        }
        wait_for_state(&f.manager, PrintState::Complete).await;
        let job = f.manager.current_job().unwrap();
        assert_eq!(job.file_position, job.file_size);
    }
}
