//! Process/thread ancestry timeline.
//!
//! The timeline answers "which package uid owned pid P at time T". It is
//! filled with lifecycle events during the collect pass, sorted once, and
//! then queried (heavily) during the transform pass. Threads usually carry
//! no uid of their own, so queries climb the parent chain backwards in time
//! until an owning uid appears or the search is abandoned.

/// Android multi-user uids repeat every user profile; app identity is the
/// remainder.
const AID_USER_OFFSET: u64 = 100_000;

/// Ancestor chains are shallow in practice. The cap bounds the cost of a
/// query and defuses malformed or cyclic parent data.
const MAX_SEARCH_DEPTH: usize = 10;

fn normalize_uid(uid: u64) -> u64 {
    uid % AID_USER_OFFSET
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Open,
    Close,
}

/// One lifecycle record: a process/thread coming into existence (with parent
/// and, for processes, owning uid) or being freed.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    kind: EventKind,
    ts: u64,
    pid: i32,
    ppid: i32,
    uid: u64,
}

impl Event {
    pub fn open(ts: u64, pid: i32, ppid: i32, uid: u64) -> Event {
        Event {
            kind: EventKind::Open,
            ts,
            pid,
            ppid,
            uid,
        }
    }

    pub fn close(ts: u64, pid: i32) -> Event {
        Event {
            kind: EventKind::Close,
            ts,
            pid,
            ppid: 0,
            uid: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.kind == EventKind::Open
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn ppid(&self) -> i32 {
        self.ppid
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl PartialEq for Event {
    /// Equality is kind-aware: parent and uid only mean something on an open
    /// event.
    fn eq(&self, other: &Event) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            EventKind::Close => self.ts == other.ts && self.pid == other.pid,
            EventKind::Open => {
                self.ts == other.ts
                    && self.pid == other.pid
                    && self.ppid == other.ppid
                    && self.uid == other.uid
            }
        }
    }
}

impl Eq for Event {}

/// A point-in-time answer: the pid asked about and the uid it resolved to,
/// `0` when unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub pid: i32,
    pub uid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

/// Append-then-freeze index from (pid, time) to lifecycle state.
///
/// All appends must happen before [`ProcessThreadTimeline::sort`]; all
/// queries after. Timelines are built once per trace and never reopened;
/// callers that need more events rebuild.
#[derive(Debug)]
pub struct ProcessThreadTimeline {
    events: Vec<Event>,
    mode: Mode,
}

impl Default for ProcessThreadTimeline {
    fn default() -> ProcessThreadTimeline {
        ProcessThreadTimeline::new()
    }
}

impl ProcessThreadTimeline {
    pub fn new() -> ProcessThreadTimeline {
        ProcessThreadTimeline {
            events: Vec::new(),
            mode: Mode::Write,
        }
    }

    pub fn append(&mut self, event: Event) {
        debug_assert_eq!(self.mode, Mode::Write, "append after sort");
        self.events.push(event);
    }

    /// Groups events by pid and collapses consecutive duplicates, moving the
    /// timeline into its read phase.
    ///
    /// Process trees emit the same open event over and over; because the
    /// sort is stable, those repeats stay adjacent within their pid group
    /// and the cheap adjacent dedup removes the common case without a full
    /// hash-based pass.
    pub fn sort(&mut self) {
        self.events.sort_by_key(|e| e.pid);
        self.events.dedup();
        self.mode = Mode::Read;
    }

    /// The highest pid or ppid mentioned by any event. Used to pick a block
    /// of ids that cannot collide with real threads.
    pub fn max_pid(&self) -> i32 {
        self.events
            .iter()
            .map(|e| e.pid.max(e.ppid))
            .max()
            .unwrap_or(0)
    }

    /// The most recent event for `pid` at or before `ts`, or `None` if there
    /// is none or the entity was closed by then. An open and a close at the
    /// same timestamp resolve to the open.
    fn find_previous_event(&self, ts: u64, pid: i32) -> Option<Event> {
        debug_assert_eq!(self.mode, Mode::Read, "query before sort");

        let group_start = self.events.partition_point(|e| e.pid < pid);

        let mut best: Option<Event> = None;
        for event in self.events[group_start..]
            .iter()
            .take_while(|e| e.pid == pid)
        {
            if event.ts > ts {
                continue;
            }
            let replace = match best {
                None => true,
                Some(b) => event.ts > b.ts || (event.ts == b.ts && event.is_open()),
            };
            if replace {
                best = Some(*event);
            }
        }

        best.filter(Event::is_open)
    }

    /// Whether the chain can be walked further from this event: either it
    /// already carries a uid, or it has a parent to climb to.
    fn test_event(event: &Event) -> bool {
        event.uid != 0 || event.ppid != 0
    }

    /// Climbs the ancestor chain at `ts` starting from `pid`.
    ///
    /// Returns the event carrying the owning uid, the last reachable event
    /// when the chain dead-ends unresolved, or `None` when the pid is
    /// unknown at `ts` or the depth cap is exhausted.
    fn search_event(&self, ts: u64, pid: i32) -> Option<Event> {
        let mut current = pid;
        for _ in 0..MAX_SEARCH_DEPTH {
            let event = self.find_previous_event(ts, current)?;
            if event.uid != 0 {
                return Some(event);
            }
            if !Self::test_event(&event) {
                // No uid and no parent: unresolved, but found.
                return Some(event);
            }
            current = event.ppid;
        }
        None
    }

    /// Resolves `pid` at `ts` to its owning uid, `0` when unresolved.
    pub fn search(&self, ts: u64, pid: i32) -> Slice {
        let uid = self.search_event(ts, pid).map_or(0, |e| e.uid);
        Slice { pid, uid }
    }

    /// Whether `pid` at `ts` belongs to the package `uid`. An unresolved pid
    /// never connects to anything.
    pub fn pid_connects_to_uid(&self, ts: u64, pid: i32, uid: u64) -> bool {
        let slice = self.search(ts, pid);
        slice.uid != 0 && normalize_uid(slice.uid) == normalize_uid(uid)
    }

    /// The number of ancestor hops needed to resolve `pid` at `ts`, for
    /// diagnostics. `None` when the pid does not resolve.
    pub fn depth(&self, ts: u64, pid: i32) -> Option<usize> {
        let mut current = pid;
        for hops in 0..MAX_SEARCH_DEPTH {
            let event = self.find_previous_event(ts, current)?;
            if event.uid != 0 {
                return Some(hops);
            }
            if !Self::test_event(&event) {
                return None;
            }
            current = event.ppid;
        }
        None
    }

    /// Rewrites every open event to carry its resolved uid directly.
    ///
    /// Events are visited and mutated by index in storage order, so a later
    /// event whose ancestor was already flattened resolves in one hop
    /// instead of re-climbing the whole chain.
    pub fn flatten(&mut self) {
        debug_assert_eq!(self.mode, Mode::Read, "flatten before sort");
        for i in 0..self.events.len() {
            let event = self.events[i];
            if !event.is_open() || event.uid != 0 {
                continue;
            }
            if let Some(found) = self.search_event(event.ts, event.pid) {
                if found.uid != 0 {
                    self.events[i].uid = found.uid;
                }
            }
        }
    }

    /// Drops every open event not owned by `package_uid`, keeping all close
    /// events. Shrinks a timeline once a single target is known; run
    /// [`ProcessThreadTimeline::flatten`] first so ownership is resolved.
    /// Opens that stayed unresolved are dropped too: they can never connect
    /// to the target.
    pub fn reduce(&mut self, package_uid: u64) {
        debug_assert_eq!(self.mode, Mode::Read, "reduce before sort");
        self.events.retain(|e| {
            !e.is_open() || (e.uid != 0 && normalize_uid(e.uid) == normalize_uid(package_uid))
        });
    }
}
