//! Worker process pool behaviour

use convenient_worker::{
    WorkerError, WorkerJobResult, WorkerProcess, WorkerProcessPool, WorkerResult,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Counters {
    started: AtomicUsize,
    handshakes: AtomicUsize,
    closed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct FakeProcess {
    counters: Arc<Counters>,
    alive: Arc<AtomicBool>,
    handshaken: bool,
    job_delay: Duration,
}

impl WorkerProcess for FakeProcess {
    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn ensure_launch_and_handshake(&mut self) -> WorkerResult<()> {
        if !self.handshaken {
            let _ = self.counters.handshakes.fetch_add(1, Ordering::SeqCst);
            self.handshaken = true;
        }
        Ok(())
    }

    fn submit_and_wait_for_job(&mut self, job_args: &str) -> WorkerResult<WorkerJobResult> {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.job_delay);
        let _ = self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(WorkerJobResult {
            exit_code: 0,
            stdout: Some(job_args.to_uppercase()),
            stderr: None,
        })
    }

    fn close(&mut self) {
        let _ = self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pool whose processes share `alive`; every started process gets a fresh `true` flag
/// unless the test flips the one it holds.
fn pool(capacity: usize, job_delay: Duration) -> (WorkerProcessPool<FakeProcess>, Arc<Counters>, Arc<std::sync::Mutex<Vec<Arc<AtomicBool>>>>) {
    let counters = Arc::new(Counters::default());
    let flags = Arc::new(std::sync::Mutex::new(Vec::new()));
    let c = Arc::clone(&counters);
    let f = Arc::clone(&flags);
    let pool = WorkerProcessPool::<FakeProcess>::new(
        capacity,
        "test-pool",
        Box::new(move || {
            let _ = c.started.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            f.lock().unwrap().push(Arc::clone(&alive));
            Ok(FakeProcess {
                counters: Arc::clone(&c),
                alive,
                handshaken: false,
                job_delay,
            })
        }),
    );
    (pool, counters, flags)
}

#[test]
fn test_processes_start_lazily_and_are_reused() {
    let (pool, counters, _) = pool(2, Duration::ZERO);
    assert_eq!(counters.started.load(Ordering::SeqCst), 0);

    for i in 0..5 {
        let mut lease = pool.borrow().unwrap();
        let result = lease.submit_and_wait_for_job(&format!("job{i}")).unwrap();
        assert_eq!(result.stdout.as_deref(), Some(format!("JOB{i}").as_str()));
    }

    // sequential borrows never need more than the slots they touched
    assert!(counters.started.load(Ordering::SeqCst) <= 2);
    assert_eq!(counters.handshakes.load(Ordering::SeqCst), counters.started.load(Ordering::SeqCst));
    pool.close().unwrap();
}

#[test]
fn test_capacity_bounds_concurrent_leases() {
    let capacity = 3;
    let (pool, counters, _) = pool(capacity, Duration::from_millis(20));
    let pool = Arc::new(pool);
    let barrier = Arc::new(Barrier::new(12));

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let _ = barrier.wait();
                let mut lease = pool.borrow().unwrap();
                lease.submit_and_wait_for_job(&i.to_string()).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().exit_code, 0);
    }

    assert!(counters.max_in_flight.load(Ordering::SeqCst) <= capacity);
    assert!(counters.started.load(Ordering::SeqCst) <= capacity);
    assert_eq!(pool.available(), capacity);
    pool.close().unwrap();
}

#[test]
fn test_extra_borrower_waits_for_release() {
    let (pool, _, _) = pool(1, Duration::ZERO);
    let lease = pool.borrow().unwrap();

    assert!(matches!(
        pool.borrow_timeout(Duration::from_millis(50)),
        Err(WorkerError::BorrowTimeout)
    ));

    drop(lease);
    assert!(pool.borrow_timeout(Duration::from_millis(50)).is_ok());
    pool.close().unwrap();
}

#[test]
fn test_dead_process_is_replaced_transparently() {
    let (pool, counters, flags) = pool(1, Duration::ZERO);

    let mut lease = pool.borrow().unwrap();
    let _ = lease.submit_and_wait_for_job("first").unwrap();
    drop(lease);
    assert_eq!(counters.started.load(Ordering::SeqCst), 1);

    flags.lock().unwrap()[0].store(false, Ordering::SeqCst);

    let mut lease = pool.borrow().unwrap();
    let result = lease.submit_and_wait_for_job("second").unwrap();
    assert_eq!(result.stdout.as_deref(), Some("SECOND"));
    drop(lease);

    assert_eq!(counters.started.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.handshakes.load(Ordering::SeqCst), 2);
    pool.close().unwrap();
}

#[test]
fn test_close_with_outstanding_lease_is_reported() {
    let (pool, counters, _) = pool(2, Duration::ZERO);
    let mut lease = pool.borrow().unwrap();
    let _ = lease.submit_and_wait_for_job("x").unwrap();

    match pool.close() {
        Err(WorkerError::PoolStillInUse { outstanding, capacity }) => {
            assert_eq!(outstanding, 1);
            assert_eq!(capacity, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    // the leased process was force-closed too
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(lease.submit_and_wait_for_job("y"), Err(WorkerError::PoolClosed)));
}

#[test]
fn test_start_failure_surfaces_and_slot_survives() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&attempts);
    let counters = Arc::new(Counters::default());
    let c = Arc::clone(&counters);
    let pool = WorkerProcessPool::<FakeProcess>::new(
        1,
        "flaky",
        Box::new(move || {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(WorkerError::EmptyCommand);
            }
            Ok(FakeProcess {
                counters: Arc::clone(&c),
                alive: Arc::new(AtomicBool::new(true)),
                handshaken: false,
                job_delay: Duration::ZERO,
            })
        }),
    );

    let mut lease = pool.borrow().unwrap();
    assert!(matches!(lease.submit_and_wait_for_job("a"), Err(WorkerError::EmptyCommand)));
    drop(lease);

    let mut lease = pool.borrow().unwrap();
    assert_eq!(lease.submit_and_wait_for_job("b").unwrap().exit_code, 0);
    drop(lease);
    pool.close().unwrap();
}

#[cfg(unix)]
mod real_process {
    use convenient_worker::{DefaultWorkerProcess, WorkerProcess, WorkerProcessParams, WorkerProcessPool};
    use std::fs;

    /// Worker that copies the job's args file into its stdout file
    const ECHO_WORKER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -E 's/.*"id":([0-9]+).*/\1/')
  case "$line" in
    *'"type":"handshake"'*)
      printf '{"type":"handshake","id":%s,"protocol_version":"0","capabilities":[]}\n' "$id"
      ;;
    *'"type":"command"'*)
      args=$(printf '%s' "$line" | sed -E 's/.*"args_path":"([^"]*)".*/\1/')
      out=$(printf '%s' "$line" | sed -E 's/.*"stdout_path":"([^"]*)".*/\1/')
      cat "$args" > "$out"
      printf '{"type":"result","id":%s,"exit_code":0}\n' "$id"
      ;;
  esac
done
"#;

    #[test]
    fn test_shell_worker_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("worker.sh");
        fs::write(&script, ECHO_WORKER).unwrap();

        let scratch = dir.path().join("scratch");
        let command = vec!["sh".to_string(), script.to_string_lossy().into_owned()];
        let pool = WorkerProcessPool::<DefaultWorkerProcess>::new(
            1,
            "sh-echo",
            Box::new(move || Ok(DefaultWorkerProcess::new(WorkerProcessParams::new(command.clone(), scratch.clone())))),
        );

        let mut lease = pool.borrow().unwrap();
        let first = lease.submit_and_wait_for_job("hello worker").unwrap();
        let second = lease.submit_and_wait_for_job("again").unwrap();
        assert_eq!(first.exit_code, 0);
        assert_eq!(first.stdout.as_deref(), Some("hello worker"));
        assert_eq!(second.stdout.as_deref(), Some("again"));
        assert!(lease.with_process(|p| Ok(p.is_alive())).unwrap());
        drop(lease);
        pool.close().unwrap();
    }
}
