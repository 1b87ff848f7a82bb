use std::{collections::VecDeque, time::Instant};

// Warnings collected while inspecting memory. Nothing here is fatal: inspection of a broken image
// goes on, and whatever went wrong along the way ends up in this list, to be shown next to the result.
pub struct Log {
    pub lines: VecDeque<String>,
    // Lines dropped because of MAX_LINES.
    pub dropped: usize,
}

const MAX_LINES: usize = 1000;

impl Log {
    pub fn new() -> Log {
        Log {lines: VecDeque::new(), dropped: 0}
    }

    pub fn add_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_LINES {
            self.lines.pop_front();
            self.dropped += 1;
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        let mut v: Vec<String> = Vec::with_capacity(self.lines.len() + 1);
        if self.dropped != 0 {
            v.push(format!("({} earlier warnings dropped)", self.dropped));
        }
        v.extend(self.lines.into_iter());
        v
    }
}

#[macro_export]
macro_rules! log {
    ($log:expr, $($arg:tt)*) => (
        ($log).add_line(format!($($arg)*))
    );
}

// A very minimal profiling thing. Prints to stderr in destructor.
pub struct ProfileScope {
    name: String,
    start: Instant,
    active: bool,
}

impl ProfileScope {
    pub fn new(name: String) -> Self {
        ProfileScope {start: Instant::now(), name, active: true}
    }

    pub fn disabled() -> Self {
        ProfileScope {start: Instant::now(), name: String::new(), active: false}
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        eprintln!("info: {} took {:.3}s", self.name, self.start.elapsed().as_secs_f64());
    }
}
