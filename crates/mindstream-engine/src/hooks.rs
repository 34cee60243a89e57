use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use mindstream_core::event::Event;
use mindstream_core::hooks::{AgentHook, HookContext};

use crate::error::panic_message;

const DEFAULT_MUTE_AFTER: u32 = 3;
const DEFAULT_MUTE_FOR: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Strikes {
    consecutive: u32,
    muted_until: Option<Instant>,
}

struct HookEntry {
    hook: Arc<dyn AgentHook>,
    strikes: Mutex<Strikes>,
}

/// Ordered list of hooks run around every model call.
///
/// Each hook receives the previous hook's output. A hook that panics is
/// treated as having returned `None` (fail-open). Panics are counted per hook
/// since one broken hook must not silence the others; after `mute_after`
/// panics in a row the hook is skipped for `mute_for`, then tried again.
pub struct HookChain {
    entries: Vec<HookEntry>,
    mute_after: u32,
    mute_for: Duration,
}

impl HookChain {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            mute_after: DEFAULT_MUTE_AFTER,
            mute_for: DEFAULT_MUTE_FOR,
        }
    }

    /// Panics in a row before a hook is muted, and how long it stays muted.
    pub fn with_mute(mut self, mute_after: u32, mute_for: Duration) -> Self {
        self.mute_after = mute_after.max(1);
        self.mute_for = mute_for;
        self
    }

    pub fn register(&mut self, hook: Arc<dyn AgentHook>) {
        self.entries.push(HookEntry {
            hook,
            strikes: Mutex::new(Strikes::default()),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.hook.name().to_string()).collect()
    }

    pub fn run_before(&self, ctx: HookContext<'_>, input: Vec<Event>) -> Vec<Event> {
        let mut current = input;
        for entry in self.live_entries() {
            let copy = current.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.hook.before(ctx, copy)));
            if let Some(replacement) = self.settle(entry, "before", outcome) {
                current = replacement;
            }
        }
        current
    }

    pub fn run_after(&self, ctx: HookContext<'_>, output: Event) -> Event {
        let mut current = output;
        for entry in self.live_entries() {
            let copy = current.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.hook.after(ctx, copy)));
            if let Some(replacement) = self.settle(entry, "after", outcome) {
                current = replacement;
            }
        }
        current
    }

    /// Entries that are not muted right now. An expired mute is lifted here.
    fn live_entries(&self) -> impl Iterator<Item = &HookEntry> {
        let now = Instant::now();
        self.entries.iter().filter(move |entry| {
            let mut strikes = entry.strikes.lock();
            match strikes.muted_until {
                Some(until) if now < until => false,
                Some(_) => {
                    strikes.muted_until = None;
                    true
                }
                None => true,
            }
        })
    }

    /// Record the outcome of one hook call and return its replacement value.
    fn settle<T>(
        &self,
        entry: &HookEntry,
        phase: &str,
        outcome: std::thread::Result<Option<T>>,
    ) -> Option<T> {
        let mut strikes = entry.strikes.lock();
        match outcome {
            Ok(replacement) => {
                strikes.consecutive = 0;
                replacement
            }
            Err(panic) => {
                let name = entry.hook.name();
                strikes.consecutive += 1;
                warn!(
                    hook = %name,
                    phase,
                    strikes = strikes.consecutive,
                    panic = %panic_message(&panic),
                    "hook panicked, keeping previous value (fail-open)"
                );
                if strikes.consecutive >= self.mute_after {
                    strikes.consecutive = 0;
                    strikes.muted_until = Some(Instant::now() + self.mute_for);
                    warn!(hook = %name, mute_secs = self.mute_for.as_secs(), "hook muted");
                }
                None
            }
        }
    }
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new()
    }
}
