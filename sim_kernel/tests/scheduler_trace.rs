//! Step-by-step scheduler trace
//!
//! Every statement is one kernel pass: the operations that change the
//! schedule, then an update that charges the head and checks which share is
//! head next and how many ticks it got. Share 0 is the idle share.
//!
//! Shares (priority, quota): 1 (2, 230), 2 (0, 170), 3 (3, 110), 4 (1, 90),
//! 5 (3, 120), 6 (0, 0), 7 (2, 180), 8 (2, 100), 9 (0, 0). Rounds are 1000
//! ticks, best-effort slots 100.

use core_types::Priority;
use sim_kernel::{CpuScheduler, SchedulerConfig, ShareId};

struct Trace {
    sched: CpuScheduler,
    shares: [Option<ShareId>; 10],
}

impl Trace {
    fn new() -> Self {
        Self {
            sched: CpuScheduler::new(SchedulerConfig {
                priority_levels: 4,
                round_quota: 1000,
                fill_quantum: 100,
                audit: false,
            }),
            shares: [None; 10],
        }
    }

    #[track_caller]
    fn share(&self, id: usize) -> ShareId {
        if id == 0 {
            return self.sched.idle();
        }
        self.shares[id].unwrap_or_else(|| panic!("share {id} does not exist"))
    }

    fn c(&mut self, id: usize) -> &mut Self {
        let (priority, quota) = match id {
            1 => (2, 230),
            2 => (0, 170),
            3 => (3, 110),
            4 => (1, 90),
            5 => (3, 120),
            6 => (0, 0),
            7 => (2, 180),
            8 => (2, 100),
            9 => (0, 0),
            _ => unreachable!(),
        };
        self.shares[id] = Some(self.sched.insert(Priority::new(priority), quota));
        self
    }

    #[track_caller]
    fn d(&mut self, id: usize) -> &mut Self {
        let share = self.share(id);
        self.sched.remove(share);
        self.shares[id] = None;
        self
    }

    #[track_caller]
    fn a(&mut self, id: usize) -> &mut Self {
        let share = self.share(id);
        self.sched.ready(share);
        self
    }

    #[track_caller]
    fn i(&mut self, id: usize) -> &mut Self {
        let share = self.share(id);
        self.sched.unready(share);
        self
    }

    fn y(&mut self) -> &mut Self {
        self.sched.yield_head();
        self
    }

    /// Ready `id` and expect the head to be outdated
    #[track_caller]
    fn o(&mut self, id: usize) -> &mut Self {
        let share = self.share(id);
        assert!(self.sched.ready_check(share), "share {id} should outdate the head");
        self
    }

    /// Ready `id` and expect the head to stay valid
    #[track_caller]
    fn n(&mut self, id: usize) -> &mut Self {
        let share = self.share(id);
        assert!(!self.sched.ready_check(share), "share {id} should not outdate the head");
        self
    }

    #[track_caller]
    fn u(&mut self, consumed: u64, head: usize, quota: u64) -> &mut Self {
        self.sched.update(consumed);
        let expected = self.share(head);
        assert_eq!(self.sched.head(), expected, "wrong head, expected share {head}");
        assert_eq!(self.sched.head_quota(), quota, "wrong head quota for share {head}");
        self
    }
}

#[test]
fn test_round_trace() {
    let mut t = Trace::new();

    // first round: idle
    t.u(10, 0, 100);
    t.u(90, 0, 100);
    t.u(120, 0, 100);
    t.u(130, 0, 100);
    t.u(140, 0, 100);
    t.u(150, 0, 100);
    t.u(160, 0, 100);
    t.u(170, 0, 100);
    t.u(180, 0, 100);
    t.u(190, 0, 100);
    t.u(200, 0, 100);

    // second round: one claim, one filler
    t.c(1).u(111, 0, 100);
    t.a(1).u(123, 1, 230);
    t.i(1).u(200, 0, 100);
    t.a(1).u(10, 1, 30);
    t.u(100, 1, 100);
    t.u(200, 1, 100);
    t.i(1).u(200, 0, 100);
    t.u(200, 0, 100);
    t.a(1).u(10, 1, 100);
    t.u(50, 1, 50);
    t.u(20, 1, 30);
    t.u(100, 1, 100);
    t.u(200, 1, 50);
    t.u(200, 1, 230);

    // third round: one claim per priority
    t.c(2).a(2).u(50, 1, 180);
    t.i(1).u(70, 2, 170);
    t.a(1).i(2).u(110, 1, 110);
    t.u(90, 1, 20);
    t.a(2).i(1).u(10, 2, 60);
    t.c(3).u(40, 2, 20);
    t.a(3).u(10, 3, 110);
    t.u(150, 2, 10);
    t.u(10, 2, 100);
    t.u(60, 2, 40);
    t.c(4).u(60, 3, 100);
    t.c(6).a(6).u(120, 2, 100);
    t.a(4).u(80, 4, 90);
    t.i(4).a(1).u(50, 1, 10);
    t.u(50, 2, 20);
    t.u(50, 6, 100);
    t.u(100, 3, 40);
    t.u(60, 3, 110);

    // fourth round: multiple claims per priority
    t.c(5).u(60, 3, 50);
    t.a(4).i(3).u(40, 1, 230);
    t.c(7).a(7).u(200, 7, 180);
    t.c(8).a(5).u(100, 5, 120);
    t.a(3).u(100, 3, 10);
    t.u(30, 5, 20);
    t.c(9).a(9).u(10, 5, 10);
    t.u(50, 7, 80);
    t.a(8).i(7).u(10, 8, 100);
    t.i(8).u(80, 1, 30);
    t.u(200, 4, 90);
    t.u(100, 2, 170);
    t.a(8).a(7).u(10, 7, 70);
    t.i(7).i(3).u(10, 8, 20);
    t.i(8).u(10, 2, 160);
    t.i(2).u(40, 1, 100);
    t.a(3).u(30, 1, 70);
    t.u(80, 6, 90);
    t.a(7).a(8).u(10, 8, 10);
    t.u(30, 7, 60);
    t.a(2).i(7).u(10, 2, 60);
    t.i(3).i(5).u(40, 2, 20);
    t.i(9).i(4).u(10, 2, 10);
    t.u(40, 1, 230);

    // fifth round: yield, ready and check
    t.i(6).u(30, 1, 200);
    t.y().u(20, 8, 100);
    t.u(200, 2, 170);
    t.y().u(70, 8, 100);
    t.i(8).u(40, 2, 100);
    t.i(1).u(50, 2, 50);
    t.u(10, 2, 40);
    t.n(1).u(200, 1, 100);
    t.u(10, 1, 90);
    t.i(1).u(10, 2, 100);
    t.o(5).u(10, 5, 120);
    t.y().u(90, 2, 90);
    t.y().u(10, 5, 100);
    t.o(7).u(10, 7, 180);
    t.y().u(10, 5, 90);
    t.y().u(10, 2, 100);
    t.y().u(10, 7, 100);
    t.i(5).u(10, 7, 90);
    t.i(7).n(5).u(10, 2, 100);
    t.n(7).u(200, 5, 100);
    t.i(5).i(7).u(10, 2, 100);
    t.i(2).u(10, 0, 100);
    t.u(10, 0, 100);
    t.u(100, 0, 100);
    t.o(9).u(10, 9, 100);
    t.n(6).u(20, 9, 80);
    t.n(8).u(10, 9, 70);
    t.y().u(10, 6, 100);
    t.y().u(10, 8, 100);
    t.n(7).y().u(20, 9, 100);
    t.i(8).i(9).u(10, 6, 100);
    t.i(6).i(7).u(10, 0, 100);
    t.o(4).u(20, 4, 90);
    t.o(3).n(1).u(10, 3, 90);
    t.n(5).i(4).u(10, 3, 80);
    t.i(3).u(10, 1, 70);
    t.o(3).u(10, 3, 60);
    t.n(4).u(10, 3, 50);
    t.i(4).u(10, 3, 40);
    t.i(3).n(4).u(10, 4, 30);
    t.i(4).u(10, 1, 20);
    t.o(3).o(4).u(10, 3, 10);
    t.y().u(10, 5, 120);

    // sixth round: destroy and re-create
    t.d(3).u(30, 5, 90);
    t.i(5).u(30, 1, 230);
    t.d(4).d(7).u(20, 1, 210);
    t.i(1).n(9).u(40, 9, 100);
    t.a(5).o(8).u(70, 5, 60);
    t.d(8).i(5).u(10, 9, 30);
    t.n(6).c(4).u(10, 9, 20);
    t.d(5).o(4).u(10, 4, 90);
    t.u(100, 9, 10);
    t.u(10, 6, 100);
    t.d(4).u(200, 9, 100);
    t.c(5).a(5).u(10, 5, 120);
    t.c(4).y().u(10, 9, 90);
    t.o(4).y().u(50, 4, 90);
    t.d(6).y().u(10, 5, 100);
    t.d(9).u(200, 4, 100);
    t.c(7).c(8).u(200, 5, 100);
    t.o(1).o(7).u(10, 7, 180);
    t.o(8).u(40, 8, 100);
    t.d(7).u(200, 1, 150);
    t.y().u(60, 5, 90);
    t.u(100, 5, 120);

    assert_eq!(t.sched.rounds(), 6);
}

#[test]
fn test_claims_in_priority_order_before_fill() {
    let mut sched = CpuScheduler::new(SchedulerConfig {
        priority_levels: 4,
        round_quota: 20,
        fill_quantum: 5,
        audit: false,
    });
    let a = sched.insert(Priority::new(3), 10);
    let b = sched.insert(Priority::new(1), 5);
    sched.ready(a);
    sched.ready(b);

    sched.update(0);
    assert_eq!((sched.head(), sched.head_quota()), (a, 10));
    sched.update(4);
    assert_eq!((sched.head(), sched.head_quota()), (a, 6));
    sched.update(6);
    assert_eq!((sched.head(), sched.head_quota()), (b, 5));
    sched.update(5);
    assert!(!sched.head_claims());
    assert_eq!((sched.head(), sched.head_quota()), (a, 5));
}
