use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use mpathd_uevent::{
    ConfigStore, DevnodeFilter, MultipathConfig, PollStatus, RawUevent, Uevent, UeventPipeline,
    UeventSource, UeventTrigger,
};

fn raw(action: &str, kernel: &str, serial: Option<&str>) -> RawUevent {
    let mut properties = vec![
        ("ACTION".to_string(), action.to_string()),
        (
            "DEVPATH".to_string(),
            format!("/devices/virtual/block/{kernel}"),
        ),
        ("SUBSYSTEM".to_string(), "block".to_string()),
    ];
    if let Some(serial) = serial {
        properties.push(("ID_SERIAL".to_string(), serial.to_string()));
    }
    RawUevent::new(properties)
}

/// Hands out queued events immediately, then idles in short sleeps so the
/// listener's flush-and-repoll cycle stays cheap.
struct FeedSource {
    events: VecDeque<RawUevent>,
}

impl UeventSource for FeedSource {
    fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        if !self.events.is_empty() {
            return Ok(PollStatus::Ready);
        }
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Ok(PollStatus::TimedOut)
    }

    fn recv(&mut self) -> Result<Option<RawUevent>> {
        Ok(self.events.pop_front())
    }
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(String, String, usize)>>>,
}

impl UeventTrigger for Recorder {
    fn handle(&mut self, event: &Uevent) -> Result<()> {
        self.seen.lock().unwrap().push((
            event.action().to_string(),
            event.kernel().to_string(),
            event.merged().len(),
        ));
        Ok(())
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn listener_and_dispatcher_coalesce_end_to_end() {
    let pipeline = Arc::new(UeventPipeline::new());
    let store = Arc::new(ConfigStore::new(MultipathConfig {
        devnode_filter: DevnodeFilter::default(),
        uid_attrs: vec!["sd:ID_SERIAL".parse().unwrap()],
    }));
    let recorder = Recorder::default();
    let seen = recorder.seen.clone();

    let dispatcher = {
        let pipeline = pipeline.clone();
        let store = store.clone();
        let mut trigger = recorder;
        thread::spawn(move || pipeline.dispatch(&store, &mut trigger))
    };
    let listener = {
        let pipeline = pipeline.clone();
        let mut source = FeedSource {
            events: [
                raw("add", "sda", Some("W1")),
                raw("add", "sdb", Some("W1")),
                raw("add", "sdc", Some("W2")),
            ]
            .into(),
        };
        thread::spawn(move || pipeline.listen(&mut source))
    };

    assert!(
        wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() >= 2),
        "events were not serviced in time"
    );
    assert!(
        wait_until(Duration::from_secs(5), || !pipeline.is_busy()),
        "pipeline did not go quiescent"
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("add".to_string(), "sdb".to_string(), 1),
            ("add".to_string(), "sdc".to_string(), 0),
        ]
    );

    pipeline.shutdown();
    dispatcher.join().unwrap().unwrap();
    listener.join().unwrap().unwrap();
}

#[test]
fn shutdown_releases_undispatched_events() {
    struct Probe(Arc<AtomicUsize>);
    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let releases = Arc::new(AtomicUsize::new(0));
    let pipeline = Arc::new(UeventPipeline::new());
    let store = ConfigStore::new(MultipathConfig::default());

    // Feed a batch through the listener, then shut down before any
    // dispatcher has drained it.
    let listener = {
        let pipeline = pipeline.clone();
        let mut source = FeedSource {
            events: [
                raw("add", "sdb", None).with_device(Box::new(Probe(releases.clone()))),
                raw("add", "sdc", None).with_device(Box::new(Probe(releases.clone()))),
            ]
            .into(),
        };
        thread::spawn(move || pipeline.listen(&mut source))
    };
    assert!(
        wait_until(Duration::from_secs(5), || pipeline.is_busy()),
        "batch was not flushed in time"
    );
    pipeline.shutdown();
    listener.join().unwrap().unwrap();

    struct Never;
    impl UeventTrigger for Never {
        fn handle(&mut self, _event: &Uevent) -> Result<()> {
            panic!("shutdown dispatch must not service events");
        }
    }
    pipeline.dispatch(&store, &mut Never).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 2);
    assert!(!pipeline.is_busy());
}
