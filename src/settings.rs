use crate::{*, error::*, vm_layout::*};
use std::time::{Duration, Instant};

// How register operands are stored in instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterEncoding {
    // Slot numbers as is.
    Plain,
    // Slot-addressing operands are stored doubled (x2-encoded), so that the interpreter can use
    // them as byte offsets of 16-byte slots with an 8x scale.
    Doubled,
}

pub struct Settings {
    pub max_frames: usize, // step budget for stack walks and table dumps; running out means the chain is corrupted
    pub max_registry_entries: usize, // step budget for scanning the JIT debug entries list
    pub time_budget: Option<Duration>,
    pub max_blob_size: usize, // trace debug objects bigger than this are treated as garbage
    pub max_string_len: usize, // longer strings are truncated when dumped
    pub register_encoding: RegisterEncoding,
    pub symfile_dir: String, // where load-trace-dwarf puts the extracted object files

    pub layout: VmLayout,
}

impl Default for Settings {
    fn default() -> Self { Settings {
        max_frames: 100_000,
        max_registry_entries: 1_000_000,
        time_budget: None,
        max_blob_size: 1 << 20,
        max_string_len: 4096,
        register_encoding: RegisterEncoding::Doubled,
        symfile_dir: "/tmp".to_string(),

        layout: VmLayout::default(),
    } }
}

impl Settings {
    pub fn frame_budget(&self) -> Budget {
        Budget::new(BudgetKind::FrameChain, self.max_frames, self.time_budget)
    }

    pub fn registry_budget(&self) -> Budget {
        Budget::new(BudgetKind::Scan, self.max_registry_entries, self.time_budget)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetKind {
    // Running out of steps means the chain doesn't terminate, i.e. it's corrupted.
    FrameChain,
    // Running out of steps just means we stop looking.
    Scan,
}

// Bounds a traversal of possibly corrupted linked structures. Checked once per step.
pub struct Budget {
    kind: BudgetKind,
    max_steps: usize,
    steps: usize,
    deadline: Option<Instant>,
}

impl Budget {
    pub fn new(kind: BudgetKind, max_steps: usize, time: Option<Duration>) -> Self {
        Budget {kind, max_steps, steps: 0, deadline: time.map(|d| Instant::now() + d)}
    }

    pub fn steps(&self) -> usize { self.steps }

    pub fn step(&mut self) -> Result<()> {
        if self.steps >= self.max_steps {
            return match self.kind {
                BudgetKind::FrameChain => err!(CorruptFrameChain, "no root frame after {} steps", self.steps),
                BudgetKind::Scan => err!(Cancelled, "gave up after {} steps", self.steps),
            };
        }
        if let Some(d) = &self.deadline {
            // Instant::now() is cheap enough, but there's no point calling it on every step.
            if self.steps % 64 == 0 && Instant::now() >= *d {
                return err!(Cancelled, "time budget exceeded after {} steps", self.steps);
            }
        }
        self.steps += 1;
        Ok(())
    }
}
