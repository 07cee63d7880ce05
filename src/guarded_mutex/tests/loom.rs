use super::*;
use crate::loom::{self, sync::Arc, thread};

#[cfg(loom)]
fn model_bounded(f: impl Fn() + Sync + Send + 'static) {
    let mut builder = ::loom::model::Builder::new();
    builder.preemption_bound = Some(3);
    builder.check(f)
}

#[cfg(not(loom))]
fn model_bounded(f: impl Fn() + Sync + Send + 'static) {
    loom::model(f)
}

#[test]
fn mutual_exclusion() {
    loom::model(|| {
        let lock = Arc::new(GuardedLock::new(0usize));

        let t1 = thread::spawn({
            let lock = lock.clone();
            move || {
                let thread = new_thread();
                let current = CurrentThread::new(&thread);
                let mut count = lock.lock(&current);
                // read and write separately, so that loom's cell checks catch
                // any unsynchronized access.
                let prev = *count;
                *count = prev + 1;
            }
        });

        let thread = new_thread();
        let current = CurrentThread::new(&thread);
        {
            let mut count = lock.lock(&current);
            let prev = *count;
            *count = prev + 1;
        }

        t1.join().unwrap();
        assert_eq!(*lock.lock(&current), 2);
        assert_eq!(current.verify_apc_balance(), Ok(()));
    });
}

#[test]
fn try_acquire_race() {
    loom::model(|| {
        let mutex = Arc::new(GuardedMutex::new());

        let try_acquire = |mutex: Arc<GuardedMutex>| {
            move || {
                let thread = new_thread();
                let current = CurrentThread::new(&thread);
                let acquired = mutex.try_acquire(&current);
                if !acquired {
                    assert_eq!(current.verify_apc_balance(), Ok(()));
                    assert!(!mutex.is_owned_by(&current));
                }
                // a winner exits still holding the lock, so that the loser
                // can't acquire it after it is released.
                acquired
            }
        };

        let t1 = thread::spawn(try_acquire(mutex.clone()));
        let t2 = thread::spawn(try_acquire(mutex.clone()));
        let winners = [t1.join().unwrap(), t2.join().unwrap()]
            .iter()
            .filter(|&&won| won)
            .count();

        assert_eq!(winners, 1);
        assert!(mutex.is_owned());
        assert_eq!(mutex.contention(), 0);
    });
}

#[test]
fn handoff() {
    loom::model(|| {
        let mutex = Arc::new(GuardedMutex::new());
        let a = new_thread();
        let a = CurrentThread::new(&a);
        mutex.acquire(&a);

        let b = thread::spawn({
            let mutex = mutex.clone();
            move || {
                let b = new_thread();
                let b = CurrentThread::new(&b);
                mutex.acquire(&b);
                assert!(mutex.is_owned_by(&b));
                mutex.release(&b);
            }
        });

        mutex.release(&a);
        b.join().unwrap();

        assert!(!mutex.is_owned());
        assert_eq!(mutex.waiters(), 0);
        assert!(
            !mutex.gate().is_signaled(),
            "every wakeup must be consumed by a waiter"
        );
    });
}

#[test]
fn no_lost_wakeups() {
    model_bounded(|| {
        let mutex = Arc::new(GuardedMutex::with_gate(CountingGate::new()));
        let a = new_thread();
        let a = CurrentThread::new(&a);
        mutex.acquire(&a);

        let waiters = (0..2)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    let thread = new_thread();
                    let current = CurrentThread::new(&thread);
                    mutex.acquire(&current);
                    mutex.release(&current);
                })
            })
            .collect::<Vec<_>>();

        mutex.release(&a);
        for waiter in waiters {
            waiter.join().unwrap();
        }

        let gate = mutex.gate();
        assert_eq!(gate.signals(), gate.waits());
        assert!(!gate.inner.is_signaled());
        assert_eq!(mutex.count.load(SeqCst), LOCK_BIT);
    });
}
