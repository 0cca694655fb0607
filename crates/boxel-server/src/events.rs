// events.rs — the simulation event queue
//
// Pending simulation work is kept in a priority queue ordered by scheduled
// time, earliest first. The queue never cancels entries: a dispatcher must
// re-check that its event is still relevant, so obsolete entries simply
// fall out when their time comes.
//
// The queue persists as a gzip text file with one line per block event,
// timestamps stored relative to the moment of writing. Tick and save
// events are not persisted; the server recreates them on startup.

use std::cmp::Ordering;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::error;

use boxel_common::blocks::Block;
use boxel_common::clock::{TimeDelta, WallTime};
use boxel_common::heap::{heap_pop, heap_push};

/// Fixed queue capacity; pushes beyond it are logged and dropped.
pub const EVENT_QUEUE_CAP: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Advance the simulation one frame.
    Tick,
    /// Persist the level and event queue if dirty.
    Save,
    /// A block changed; run reactions.
    Update {
        x: i32,
        y: i32,
        z: i32,
        old_t: Block,
        new_t: Block,
    },
    /// Reconsider fluid propagation from this cell.
    Flow { x: i32, y: i32, z: i32 },
    /// Reconsider vegetation state at this cell.
    Grow { x: i32, y: i32, z: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub time: WallTime,
    pub kind: EventKind,
}

/// Orders the earliest scheduled time as the greatest element, so the
/// max-heap pops the next event to fire.
fn event_cmp(a: &Event, b: &Event) -> Ordering {
    b.time.cmp(&a.time)
}

pub struct EventQueue {
    heap: Vec<Event>,
    dirty: bool,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            heap: Vec::new(),
            dirty: false,
        }
    }

    pub fn count(&self) -> usize {
        self.heap.len()
    }

    pub fn push(&mut self, event: Event) {
        if self.heap.len() == EVENT_QUEUE_CAP {
            error!("can't push {:?}; event queue full", event.kind);
            return;
        }
        heap_push(&mut self.heap, event, &event_cmp);
        self.dirty = true;
    }

    /// The next event to fire, without removing it.
    pub fn peek(&self) -> Option<&Event> {
        self.heap.first()
    }

    pub fn pop(&mut self) -> Option<Event> {
        let event = heap_pop(&mut self.heap, &event_cmp)?;
        self.dirty = true;
        Some(event)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Writes all block events to `path` as gzip text, with times stored
    /// relative to now. Clears the dirty flag on success.
    pub fn write(&mut self, path: &Path) -> Result<()> {
        let now = WallTime::now();
        let file = std::fs::File::create(path)
            .with_context(|| format!("could not open {} for writing", path.display()))?;
        let mut out = GzEncoder::new(file, Compression::default());

        for event in &self.heap {
            let delta = event.time - now;
            match event.kind {
                // Not persisted; recreated on boot.
                EventKind::Tick | EventKind::Save => {}

                EventKind::Update { x, y, z, old_t, new_t } => {
                    writeln!(
                        out,
                        "update {} {} {x} {y} {z} {old_t} {new_t}",
                        delta.sec, delta.usec
                    )?;
                }
                EventKind::Flow { x, y, z } => {
                    writeln!(out, "flow {} {} {x} {y} {z}", delta.sec, delta.usec)?;
                }
                EventKind::Grow { x, y, z } => {
                    writeln!(out, "grow {} {} {x} {y} {z}", delta.sec, delta.usec)?;
                }
            }
        }

        out.finish().context("failed to finish event log stream")?;
        self.dirty = false;
        Ok(())
    }

    /// Reads events from `path`, rebuilding absolute times relative to
    /// now. Unparseable lines are logged and skipped.
    pub fn read(&mut self, path: &Path) -> Result<()> {
        let now = WallTime::now();
        let file = std::fs::File::open(path)
            .with_context(|| format!("could not open {} for reading", path.display()))?;
        let reader = BufReader::new(GzDecoder::new(file));

        for line in reader.lines() {
            let line = line.context("failed to read event log line")?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_event_line(&line, now) {
                Some(event) => self.push(event),
                None => error!("could not parse event line: {line}"),
            }
        }
        Ok(())
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_event_line(line: &str, now: WallTime) -> Option<Event> {
    let mut tokens = line.split_whitespace();
    let kind = tokens.next()?;
    let mut num = || -> Option<i64> { tokens.next()?.parse().ok() };

    let sec = num()?;
    let usec = num()?;
    let x = num()? as i32;
    let y = num()? as i32;
    let z = num()? as i32;

    let kind = match kind {
        "update" => {
            let old_t = num()? as Block;
            let new_t = num()? as Block;
            EventKind::Update { x, y, z, old_t, new_t }
        }
        "flow" => EventKind::Flow { x, y, z },
        "grow" => EventKind::Grow { x, y, z },
        _ => return None,
    };

    Some(Event {
        time: now + TimeDelta::new(sec, usec),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxel_common::clock::TimeDelta;

    fn at(base: WallTime, ms: i64, kind: EventKind) -> Event {
        Event {
            time: base + TimeDelta::from_millis(ms),
            kind,
        }
    }

    #[test]
    fn test_pop_order_is_earliest_first() {
        let base = WallTime::from_parts(1000, 0);
        let mut queue = EventQueue::new();
        queue.push(at(base, 500, EventKind::Tick));
        queue.push(at(base, 100, EventKind::Save));
        queue.push(at(base, 300, EventKind::Flow { x: 1, y: 2, z: 3 }));

        assert_eq!(queue.peek().unwrap().kind, EventKind::Save);
        assert_eq!(queue.pop().unwrap().kind, EventKind::Save);
        assert_eq!(queue.pop().unwrap().kind, EventKind::Flow { x: 1, y: 2, z: 3 });
        assert_eq!(queue.pop().unwrap().kind, EventKind::Tick);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_dirty_flag() {
        let mut queue = EventQueue::new();
        assert!(!queue.is_dirty());
        queue.push(at(WallTime::from_parts(0, 0), 0, EventKind::Tick));
        assert!(queue.is_dirty());
        queue.clear_dirty();
        queue.pop();
        assert!(queue.is_dirty());
    }

    #[test]
    fn test_write_read_round_trip_preserves_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.txt.gz");

        let base = WallTime::now();
        let mut queue = EventQueue::new();
        queue.push(at(
            base,
            1500,
            EventKind::Update { x: 3, y: 4, z: 5, old_t: 0, new_t: 19 },
        ));
        queue.push(Event {
            time: base + TimeDelta::new(30, 123),
            kind: EventKind::Grow { x: 1, y: 0, z: 1 },
        });
        queue.push(at(base, 300, EventKind::Flow { x: 250, y: 60, z: 250 }));
        // Tick and save events must not be persisted.
        queue.push(at(base, 0, EventKind::Tick));
        queue.push(at(base, 0, EventKind::Save));

        queue.write(&path).unwrap();
        assert!(!queue.is_dirty());

        let mut restored = EventQueue::new();
        restored.read(&path).unwrap();
        assert_eq!(restored.count(), 3);

        let mut orig = Vec::new();
        while let Some(ev) = queue.pop() {
            if !matches!(ev.kind, EventKind::Tick | EventKind::Save) {
                orig.push(ev);
            }
        }
        let mut back = Vec::new();
        while let Some(ev) = restored.pop() {
            back.push(ev);
        }

        // Absolute times shift by the write/read gap, but the event kinds,
        // their order, and the pairwise spacing survive to the microsecond.
        assert_eq!(
            orig.iter().map(|e| e.kind).collect::<Vec<_>>(),
            back.iter().map(|e| e.kind).collect::<Vec<_>>()
        );
        for i in 1..orig.len() {
            assert_eq!(
                orig[i].time - orig[0].time,
                back[i].time - back[0].time
            );
        }
    }

    #[test]
    fn test_read_skips_malformed_lines() {
        let now = WallTime::now();
        assert!(parse_event_line("update 0 0 1 2 3 0 19", now).is_some());
        assert!(parse_event_line("flow 0 300000 1 2 3", now).is_some());
        assert!(parse_event_line("grow 3 0 1 2 3", now).is_some());
        assert!(parse_event_line("melt 0 0 1 2 3", now).is_none());
        assert!(parse_event_line("update 0 0 1 2", now).is_none());
        assert!(parse_event_line("flow 0 zzz 1 2 3", now).is_none());
    }

    #[test]
    fn test_read_rebuilds_relative_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.txt.gz");

        let mut queue = EventQueue::new();
        queue.push(Event {
            time: WallTime::now() + TimeDelta::new(30, 0),
            kind: EventKind::Grow { x: 1, y: 0, z: 1 },
        });
        queue.write(&path).unwrap();

        let mut restored = EventQueue::new();
        restored.read(&path).unwrap();
        let delta = restored.pop().unwrap().time - WallTime::now();

        // Still roughly 30 seconds out from the new "now".
        assert!(delta.sec >= 28 && delta.sec <= 30, "delta = {delta:?}");
    }

    #[test]
    fn test_read_missing_file_is_error() {
        let mut queue = EventQueue::new();
        assert!(queue.read(Path::new("/nonexistent/events.txt.gz")).is_err());
    }
}
