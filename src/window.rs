// Window module
// Holds the forward and history queues around the playback cursor and implements every
// queue algorithm the cache needs. The cache runs these under its navigation lock; nothing
// in here locks or talks to the backing store.

use std::collections::VecDeque;

use crate::store::{Frame, FrameIndex};

/// Sizing derived from a CacheConfig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowParams {
    /// Frames to keep on each side of the cursor.
    pub target: usize,
    /// Batch size of a single store query.
    pub frames_per_query: usize,
    /// Effective playback rate handed through to the store.
    pub frame_rate: f64,
    /// A top-up starts once the forward queue holds this many frames or fewer.
    pub refill_below: usize,
}

/// What a skip did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Skip {
    /// Frames were moved between the queues without touching the store.
    Drained(usize),
    /// The target is not known to be resident; the caller has to seek there.
    OutOfWindow(FrameIndex),
}

/// A store fetch to run outside the navigation lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FetchPlan {
    pub start: FrameIndex,
    pub count: usize,
    pub frame_rate: f64,
    /// Flush epoch the fetch was planned in. A splice into a newer epoch is dropped.
    pub epoch: u64,
    /// The plan serves a pending seek (both queues were just flushed).
    pub seek: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RefillPlan {
    Fetch(FetchPlan),
    TrimmedForward(usize),
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Splice {
    Appended(usize),
    Discarded,
}

pub(crate) struct Window {
    // Not yet consumed, ascending.
    forward: VecDeque<Frame>,
    // Already consumed, ascending, most recent at the back.
    history: VecDeque<Frame>,
    cursor: FrameIndex,
    pending_seek: Option<FrameIndex>,
    // Bumped on every flush so fetches planned before it can be recognised as stale.
    epoch: u64,
    params: WindowParams,
}

impl Window {
    pub fn new(cursor: FrameIndex, params: WindowParams) -> Self {
        Self {
            forward: VecDeque::new(),
            history: VecDeque::new(),
            cursor,
            pending_seek: None,
            epoch: 0,
            params,
        }
    }

    pub fn params(&self) -> WindowParams {
        self.params
    }

    /// New sizing only shapes future refills and trims; callers flush via a seek to apply it.
    pub fn set_params(&mut self, params: WindowParams) {
        self.params = params;
    }

    pub fn cursor(&self) -> FrameIndex {
        self.cursor
    }

    pub fn forward_len(&self) -> usize {
        self.forward.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    #[cfg(test)]
    pub fn pending_seek(&self) -> Option<FrameIndex> {
        self.pending_seek
    }

    /// Moves the earliest forward frame onto the history tail.
    pub fn advance(&mut self) -> Option<Frame> {
        let frame = self.forward.pop_front()?;
        self.cursor = frame.index;
        self.history.push_back(frame.clone());
        self.trim_history();
        Some(frame)
    }

    /// Moves the latest history frame back onto the front of the forward queue.
    pub fn retreat(&mut self) -> Option<Frame> {
        let frame = self.history.pop_back()?;
        self.cursor = frame.index;
        self.forward.push_front(frame.clone());
        Some(frame)
    }

    /// Skips `frames` frames ahead of the one the next advance would return.
    /// Drained skips and seeks resume at the same index on a dense recording.
    pub fn skip_forward(&mut self, frames: usize) -> Skip {
        if frames == 0 {
            return Skip::Drained(0);
        }
        let resume = self.resume_index().saturating_add(frames as u64);
        match self.forward.back() {
            Some(last) if last.index >= resume.saturating_sub(1) => {}
            _ => return Skip::OutOfWindow(resume),
        }

        let mut moved = 0;
        while moved < frames {
            let Some(frame) = self.forward.pop_front() else { break };
            self.cursor = frame.index;
            self.history.push_back(frame);
            moved += 1;
        }
        self.trim_history();
        Skip::Drained(moved)
    }

    pub fn skip_backward(&mut self, frames: usize) -> Skip {
        if frames == 0 {
            return Skip::Drained(0);
        }
        let resume = self.resume_index().saturating_sub(frames as u64);
        match self.history.front() {
            Some(first) if first.index <= resume => {}
            _ => return Skip::OutOfWindow(resume),
        }

        let mut moved = 0;
        while moved < frames {
            let Some(frame) = self.history.pop_back() else { break };
            self.cursor = frame.index;
            self.forward.push_front(frame);
            moved += 1;
        }
        Skip::Drained(moved)
    }

    /// Records a seek for the next refill pass to honour. The cursor reports the target
    /// until the pass settles.
    pub fn request_seek(&mut self, index: FrameIndex) {
        self.pending_seek = Some(index);
        self.cursor = index;
    }

    /// Decides what a refill pass should do, performing the in-memory part right away.
    pub fn plan_refill(&mut self) -> RefillPlan {
        if let Some(index) = self.pending_seek.take() {
            self.flush();
            self.cursor = index;
            return RefillPlan::Fetch(self.fetch_plan(index, true));
        }
        if self.forward.len() > self.params.target {
            return RefillPlan::TrimmedForward(self.trim_forward());
        }
        if self.forward.len() <= self.params.refill_below {
            let start = self.next_fetch_index();
            return RefillPlan::Fetch(self.fetch_plan(start, false));
        }
        RefillPlan::Idle
    }

    /// Appends a fetched batch to the forward queue.
    ///
    /// Frames that do not sort after everything already resident are skipped, and the
    /// forward queue is capped at the target size afterwards.
    pub fn splice(&mut self, epoch: u64, frames: Vec<Frame>) -> Splice {
        if epoch != self.epoch || self.pending_seek.is_some() {
            return Splice::Discarded;
        }
        let mut last = self.last_resident_index();
        let mut appended = 0usize;
        for frame in frames {
            if last.map_or(true, |l| frame.index > l) {
                last = Some(frame.index);
                self.forward.push_back(frame);
                appended += 1;
            }
        }
        let trimmed = self.trim_forward();
        Splice::Appended(appended.saturating_sub(trimmed))
    }

    /// Points the cursor at the resident frame nearest a finished seek.
    pub fn settle_after_seek(&mut self, requested: FrameIndex) {
        // A newer seek is in flight; it settles the cursor itself.
        if self.pending_seek.is_some() {
            return;
        }
        self.cursor = self
            .forward
            .front()
            .or_else(|| self.history.back())
            .map(|f| f.index)
            .unwrap_or(requested);
    }

    pub fn trim_history(&mut self) -> usize {
        let excess = self.history.len().saturating_sub(self.params.target);
        self.history.drain(..excess);
        excess
    }

    fn trim_forward(&mut self) -> usize {
        let excess = self.forward.len().saturating_sub(self.params.target);
        self.forward.truncate(self.params.target);
        excess
    }

    fn flush(&mut self) {
        self.forward.clear();
        self.history.clear();
        self.epoch += 1;
    }

    fn last_resident_index(&self) -> Option<FrameIndex> {
        self.forward.back().or_else(|| self.history.back()).map(|f| f.index)
    }

    // Index the next advance returns on a dense recording. The cursor frame counts as
    // consumed once it sits at the back of history.
    fn resume_index(&self) -> FrameIndex {
        match self.history.back() {
            Some(last) if last.index == self.cursor => self.cursor.saturating_add(1),
            _ => self.cursor,
        }
    }

    fn next_fetch_index(&self) -> FrameIndex {
        self.last_resident_index()
            .map(|i| i.saturating_add(1))
            .unwrap_or(self.cursor)
    }

    fn fetch_plan(&self, start: FrameIndex, seek: bool) -> FetchPlan {
        FetchPlan {
            start,
            count: self.params.frames_per_query,
            frame_rate: self.params.frame_rate,
            epoch: self.epoch,
            seek,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn params(target: usize, frames_per_query: usize) -> WindowParams {
        WindowParams {
            target,
            frames_per_query,
            frame_rate: 10.0,
            refill_below: target * 4 / 5,
        }
    }

    fn frames(range: std::ops::Range<FrameIndex>) -> Vec<Frame> {
        range.map(|i| Frame::new(i, Bytes::new())).collect()
    }

    fn indices(queue: &VecDeque<Frame>) -> Vec<FrameIndex> {
        queue.iter().map(|f| f.index).collect()
    }

    // Dense recording [0, max]: probe like the cache does and splice the first hit.
    fn run_refill(window: &mut Window, max: FrameIndex) {
        if let RefillPlan::Fetch(plan) = window.plan_refill() {
            let mut start = plan.start;
            while start <= max {
                let end = (start + plan.count as u64).min(max + 1);
                let batch = frames(start..end);
                if !batch.is_empty() {
                    window.splice(plan.epoch, batch);
                    break;
                }
                start += plan.count as u64;
            }
        }
        window.trim_history();
    }

    fn seek(window: &mut Window, index: FrameIndex, max: FrameIndex) {
        window.request_seek(index.min(max));
        run_refill(window, max);
        window.settle_after_seek(index.min(max));
    }

    fn filled(target: usize, fpq: usize) -> Window {
        let mut window = Window::new(0, params(target, fpq));
        run_refill(&mut window, 999);
        window
    }

    #[test]
    fn test_initial_refill_fills_to_target() {
        let window = filled(20, 20);
        assert_eq!(indices(&window.forward), (0..20).collect::<Vec<_>>());
        assert_eq!(window.history_len(), 0);
        assert_eq!(window.cursor(), 0);
    }

    #[test]
    fn test_advance_then_retreat_round_trip() {
        let mut window = filled(20, 20);
        window.advance();
        let last = window.advance().unwrap();
        assert_eq!(window.cursor(), 1);

        let back = window.retreat().unwrap();
        assert_eq!(back, last);
        assert_eq!(window.cursor(), 1);
        assert_eq!(window.forward.front().unwrap().index, 1);
    }

    #[test]
    fn test_advance_on_empty_forward() {
        let mut window = Window::new(0, params(20, 20));
        assert!(window.advance().is_none());
        assert!(window.retreat().is_none());
        assert_eq!(window.cursor(), 0);
    }

    #[test]
    fn test_history_trimmed_to_target() {
        let mut window = Window::new(0, params(4, 20));
        window.splice(0, frames(0..4));
        for _ in 0..4 {
            window.advance();
        }
        window.splice(0, frames(4..8));
        for _ in 0..3 {
            window.advance();
        }
        assert_eq!(indices(&window.history), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_refill_threshold_hysteresis() {
        let mut window = filled(20, 20);
        for _ in 0..3 {
            window.advance();
        }
        // 17 forward frames is above the 80% mark.
        assert_eq!(window.plan_refill(), RefillPlan::Idle);

        window.advance();
        match window.plan_refill() {
            RefillPlan::Fetch(plan) => {
                assert_eq!(plan.start, 20);
                assert_eq!(plan.count, 20);
                assert!(!plan.seek);
            }
            other => panic!("expected fetch, got {:?}", other),
        }
    }

    #[test]
    fn test_splice_caps_forward_at_target() {
        let mut window = filled(20, 20);
        for _ in 0..4 {
            window.advance();
        }
        run_refill(&mut window, 999);
        assert_eq!(window.forward_len(), 20);
        assert_eq!(window.forward.back().unwrap().index, 23);
    }

    #[test]
    fn test_overfull_forward_is_trimmed() {
        let mut window = filled(5, 5);
        for _ in 0..5 {
            window.advance();
        }
        window.splice(0, frames(5..10));
        for _ in 0..5 {
            window.retreat();
        }
        assert_eq!(window.forward_len(), 10);
        assert_eq!(window.plan_refill(), RefillPlan::TrimmedForward(5));
        assert_eq!(indices(&window.forward), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_seek_flushes_and_fetches_from_target() {
        let mut window = filled(20, 20);
        window.advance();
        window.request_seek(500);
        assert_eq!(window.cursor(), 500);

        match window.plan_refill() {
            RefillPlan::Fetch(plan) => {
                assert!(plan.seek);
                assert_eq!(plan.start, 500);
                assert_eq!(plan.epoch, 1);
            }
            other => panic!("expected fetch, got {:?}", other),
        }
        assert_eq!(window.forward_len(), 0);
        assert_eq!(window.history_len(), 0);
        assert!(window.pending_seek().is_none());
    }

    #[test]
    fn test_stale_splice_is_discarded() {
        let mut window = filled(20, 20);
        for _ in 0..4 {
            window.advance();
        }
        let RefillPlan::Fetch(stale) = window.plan_refill() else {
            panic!("expected fetch");
        };
        seek(&mut window, 500, 999);
        assert_eq!(window.splice(stale.epoch, frames(20..40)), Splice::Discarded);
        assert_eq!(window.forward.front().unwrap().index, 500);
    }

    #[test]
    fn test_splice_discarded_while_seek_pending() {
        let mut window = Window::new(0, params(20, 20));
        window.request_seek(40);
        assert_eq!(window.splice(0, frames(0..20)), Splice::Discarded);
    }

    #[test]
    fn test_splice_skips_frames_already_passed() {
        let mut window = filled(20, 20);
        for _ in 0..10 {
            window.advance();
        }
        assert_eq!(window.splice(0, frames(15..25)), Splice::Appended(5));
        assert_eq!(window.forward.back().unwrap().index, 24);
        assert_eq!(window.forward_len(), 15);
    }

    #[test]
    fn test_skip_forward_in_window() {
        let mut window = filled(20, 20);
        window.advance();
        assert_eq!(window.skip_forward(10), Skip::Drained(10));
        assert_eq!(window.cursor(), 10);
        assert_eq!(window.forward.front().unwrap().index, 11);
    }

    #[test]
    fn test_skip_forward_out_of_window() {
        let mut window = filled(20, 20);
        window.advance();
        assert_eq!(window.skip_forward(30), Skip::OutOfWindow(31));
        assert_eq!(window.forward_len(), 19);
    }

    #[test]
    fn test_skip_forward_resumes_same_distance_on_both_paths() {
        // Nothing consumed yet: frame 0 is next, so ten frames on resumes at 10.
        let mut window = filled(20, 20);
        assert_eq!(window.skip_forward(10), Skip::Drained(10));
        assert_eq!(window.forward.front().unwrap().index, 10);

        // Frame 9 consumed, 10 is next: 25 frames on is 35, past the buffered 19.
        assert_eq!(window.skip_forward(25), Skip::OutOfWindow(35));
        seek(&mut window, 35, 999);
        assert_eq!(window.advance().unwrap().index, 35);

        // From a consumed cursor the drained path lands the same distance ahead.
        assert_eq!(window.skip_forward(5), Skip::Drained(5));
        assert_eq!(window.advance().unwrap().index, 41);
    }

    #[test]
    fn test_skip_backward_in_and_out_of_window() {
        let mut window = filled(20, 20);
        for _ in 0..15 {
            window.advance();
        }
        assert_eq!(window.skip_backward(5), Skip::Drained(5));
        assert_eq!(window.cursor(), 10);
        assert_eq!(window.history.back().unwrap().index, 9);

        // History only reaches back to frame 4 once trimmed to a target of 4.
        let mut trimmed = Window::new(0, params(4, 20));
        trimmed.splice(0, frames(0..4));
        for _ in 0..4 {
            trimmed.advance();
        }
        trimmed.splice(0, frames(4..8));
        for _ in 0..4 {
            trimmed.advance();
        }
        assert_eq!(trimmed.cursor(), 7);
        assert_eq!(trimmed.skip_backward(5), Skip::OutOfWindow(3));
        assert_eq!(trimmed.skip_backward(3), Skip::Drained(3));
        assert_eq!(trimmed.cursor(), 5);
    }

    #[test]
    fn test_settle_prefers_history_when_forward_empty() {
        let mut window = Window::new(0, params(20, 20));
        window.splice(0, frames(995..1000));
        for _ in 0..5 {
            window.advance();
        }
        window.settle_after_seek(999);
        assert_eq!(window.cursor(), 999);

        let mut empty = Window::new(0, params(20, 20));
        empty.settle_after_seek(42);
        assert_eq!(empty.cursor(), 42);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Advance,
        Retreat,
        SkipForward(usize),
        SkipBackward(usize),
        Refill,
        Seek(FrameIndex),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Advance),
            2 => Just(Op::Retreat),
            1 => (0usize..40).prop_map(Op::SkipForward),
            1 => (0usize..40).prop_map(Op::SkipBackward),
            3 => Just(Op::Refill),
            1 => (0u64..1200).prop_map(Op::Seek),
        ]
    }

    proptest! {
        #[test]
        fn prop_queues_stay_ordered_and_bounded(
            target in 1usize..30,
            fpq in 1usize..30,
            ops in proptest::collection::vec(op(), 1..200),
        ) {
            const MAX: FrameIndex = 999;
            let mut window = Window::new(0, params(target, fpq));
            for op in ops {
                match op {
                    Op::Advance => { window.advance(); }
                    Op::Retreat => { window.retreat(); }
                    Op::SkipForward(n) => {
                        if let Skip::OutOfWindow(t) = window.skip_forward(n) {
                            seek(&mut window, t, MAX);
                        }
                    }
                    Op::SkipBackward(n) => {
                        if let Skip::OutOfWindow(t) = window.skip_backward(n) {
                            seek(&mut window, t, MAX);
                        }
                    }
                    Op::Refill => run_refill(&mut window, MAX),
                    Op::Seek(i) => seek(&mut window, i, MAX),
                }

                let fwd = indices(&window.forward);
                let hist = indices(&window.history);
                prop_assert!(fwd.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(hist.windows(2).all(|w| w[0] < w[1]));
                if let (Some(h), Some(f)) = (hist.last(), fwd.first()) {
                    prop_assert!(h < f);
                }
                prop_assert!(fwd.len() + hist.len() <= 2 * target + fpq);
            }
        }

        #[test]
        fn prop_advances_walk_consecutive_indices(target in 1usize..30, fpq in 1usize..30, steps in 1usize..300) {
            let mut window = Window::new(0, params(target, fpq));
            let mut expected = 0;
            for _ in 0..steps {
                run_refill(&mut window, 999);
                if let Some(frame) = window.advance() {
                    prop_assert_eq!(frame.index, expected);
                    prop_assert_eq!(window.cursor(), expected);
                    expected += 1;
                }
            }
        }
    }
}
