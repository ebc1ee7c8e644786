//! Property-based tests for the AIO backend.
//!
//! Random sequences of enqueue / submit / cancel / complete / drain /
//! dispatch / release calls against the simulated kernel, checking after
//! every step that the capacity and queue-membership invariants hold and
//! that no callback ever fires twice.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evaio::{AioConfig, AioContext, AioOp, CancelOutcome, LocalReactor, OpHandle, OpState, SimKernel};
use nix::errno::Errno;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Action {
    Enqueue,
    Submit,
    Cancel(usize),
    Complete(usize),
    CompleteWithError(usize),
    Drain,
    Dispatch,
    Release(usize),
    AcceptLimit(Option<usize>),
    FailSubmissions(bool),
    FailCancels(bool),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => Just(Action::Enqueue),
        3 => Just(Action::Submit),
        2 => any::<usize>().prop_map(Action::Cancel),
        2 => (1usize..4).prop_map(Action::Complete),
        1 => (1usize..3).prop_map(Action::CompleteWithError),
        2 => Just(Action::Drain),
        2 => Just(Action::Dispatch),
        1 => any::<usize>().prop_map(Action::Release),
        1 => proptest::option::of(0usize..3).prop_map(Action::AcceptLimit),
        1 => any::<bool>().prop_map(Action::FailSubmissions),
        1 => any::<bool>().prop_map(Action::FailCancels),
    ]
}

struct Tracked {
    handle: OpHandle,
    fired: Arc<AtomicUsize>,
    dequeued: bool,
    released: bool,
}

struct Harness {
    ctx: AioContext<SimKernel, LocalReactor>,
    reactor: LocalReactor,
    ops: Vec<Tracked>,
}

impl Harness {
    fn new(capacity: usize) -> Self {
        let reactor = LocalReactor::new();
        let config = AioConfig::builder().capacity(capacity).build().unwrap();
        let ctx = AioContext::with_kernel(&config, reactor.clone(), SimKernel::setup).unwrap();
        Self {
            ctx,
            reactor,
            ops: Vec::new(),
        }
    }

    fn enqueue(&mut self) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut op = AioOp::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        op.prepare_read(3, vec![0; 8], 8, 0, 0).unwrap();
        let handle = self.ctx.enqueue(op).unwrap();
        self.ops.push(Tracked {
            handle,
            fired,
            dequeued: false,
            released: false,
        });
    }

    fn pick(&self, index: usize) -> Option<usize> {
        if self.ops.is_empty() {
            None
        } else {
            Some(index % self.ops.len())
        }
    }

    fn dispatch(&mut self) {
        for activation in self.reactor.drain_activations() {
            self.ctx.dispatch(activation.op).unwrap();
        }
    }

    fn apply(&mut self, action: &Action) {
        match *action {
            Action::Enqueue => self.enqueue(),
            Action::Submit => {
                self.ctx.submit().unwrap();
            }
            Action::Cancel(i) => {
                let Some(i) = self.pick(i) else { return };
                if self.ops[i].released {
                    return;
                }
                let outcome = self.ctx.cancel(self.ops[i].handle).unwrap();
                if outcome == CancelOutcome::Dequeued {
                    self.ops[i].dequeued = true;
                }
            }
            Action::Complete(n) => {
                for _ in 0..n {
                    self.ctx.kernel_mut().complete_next(8);
                }
            }
            Action::CompleteWithError(n) => {
                for _ in 0..n {
                    self.ctx.kernel_mut().complete_next(-(Errno::EIO as i64));
                }
            }
            Action::Drain => {
                self.ctx.on_notify().unwrap();
            }
            Action::Dispatch => self.dispatch(),
            Action::Release(i) => {
                let Some(i) = self.pick(i) else { return };
                let tracked = &self.ops[i];
                if tracked.released {
                    return;
                }
                let releasable = match self.ctx.state(tracked.handle) {
                    Some(OpState::Cancelled) => true,
                    Some(OpState::Completed) => tracked.fired.load(Ordering::SeqCst) == 1,
                    _ => false,
                };
                if releasable {
                    self.ctx.release(tracked.handle).unwrap();
                    self.ops[i].released = true;
                } else {
                    assert!(self.ctx.release(tracked.handle).is_err());
                }
            }
            Action::AcceptLimit(limit) => self.ctx.kernel_mut().set_accept_limit(limit),
            Action::FailSubmissions(on) => self
                .ctx
                .kernel_mut()
                .fail_submissions(on.then_some(Errno::EBADF)),
            Action::FailCancels(on) => self
                .ctx
                .kernel_mut()
                .fail_cancels(on.then_some(Errno::EINVAL)),
        }
    }

    fn check(&self) {
        self.ctx.assert_invariants();
        assert!(self.ctx.kernel().in_flight() <= self.ctx.capacity());
        assert!(self.ctx.kernel().peak_in_flight() <= self.ctx.capacity());
        for tracked in &self.ops {
            assert!(tracked.fired.load(Ordering::SeqCst) <= 1, "{} fired twice", tracked.handle);
        }
    }

    /// Clear every fault and drive all outstanding work to completion.
    fn settle(&mut self) {
        let kernel = self.ctx.kernel_mut();
        kernel.set_accept_limit(None);
        kernel.fail_submissions(None);
        kernel.fail_cancels(None);

        for _ in 0..(self.ops.len() + 2) {
            self.ctx.submit().unwrap();
            self.ctx.kernel_mut().complete_all(|_| 8);
            self.ctx.on_notify().unwrap();
            self.dispatch();
            self.check();
            if self.ctx.pending_len() == 0 && self.ctx.in_flight() == 0 {
                break;
            }
        }
        assert_eq!(self.ctx.pending_len(), 0);
        assert_eq!(self.ctx.in_flight(), 0);
    }
}

proptest! {
    /// Capacity, queue membership and at-most-once dispatch hold after every
    /// step, and once settled every non-dequeued operation fired exactly once.
    #[test]
    fn invariants_hold_for_any_sequence(
        capacity in 1usize..6,
        actions in prop::collection::vec(action(), 1..80),
    ) {
        let mut harness = Harness::new(capacity);
        for action in &actions {
            harness.apply(action);
            harness.check();
        }

        harness.settle();
        for tracked in &harness.ops {
            let fired = tracked.fired.load(Ordering::SeqCst);
            if tracked.dequeued {
                prop_assert_eq!(fired, 0);
            } else {
                prop_assert_eq!(fired, 1);
            }
        }
    }

    /// The first pass submits exactly `min(N, queued)` operations.
    #[test]
    fn first_pass_fills_window(capacity in 1usize..16, queued in 0usize..40) {
        let mut harness = Harness::new(capacity);
        for _ in 0..queued {
            harness.enqueue();
        }

        let report = harness.ctx.submit().unwrap();
        prop_assert_eq!(report.submitted, capacity.min(queued));
        prop_assert_eq!(report.deferred, queued.saturating_sub(capacity));
        prop_assert_eq!(harness.ctx.in_flight(), capacity.min(queued));
    }

    /// Any accept limit submits everything in enqueue order.
    #[test]
    fn partial_acceptance_preserves_order(limit in 1usize..4, queued in 1usize..12) {
        let mut harness = Harness::new(16);
        for _ in 0..queued {
            harness.enqueue();
        }
        harness.ctx.kernel_mut().set_accept_limit(Some(limit));

        let report = harness.ctx.submit().unwrap();
        prop_assert_eq!(report.submitted, queued);
        prop_assert_eq!(report.batches, queued.div_ceil(limit));

        let order: Vec<u64> = harness.ctx.kernel().in_flight_requests().map(|r| r.data).collect();
        let expected: Vec<u64> = harness.ops.iter().map(|t| t.handle.to_user_data()).collect();
        prop_assert_eq!(order, expected);
    }
}
