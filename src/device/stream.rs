//! Command streams.

/// One unit of device work: a kernel dispatch, a copy, or a host callback.
pub struct Command {
    run: Box<dyn FnOnce() + Send>,
}

impl Command {
    pub fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self { run: Box::new(run) }
    }

    fn execute(self) {
        (self.run)();
    }

    /// Runs the command immediately, outside any stream. Test and
    /// build-time helper.
    pub fn run_now(self) {
        self.execute();
    }
}

/// An ordered command queue.
///
/// Commands accumulate until `commit`, which flushes them to the device in
/// submission order. `synchronize` commits and then waits for completion;
/// any host read of device-produced memory must happen after it.
#[derive(Default)]
pub struct Stream {
    queue: Vec<Command>,
}

impl Stream {
    pub fn new() -> Self {
        Self { queue: Vec::new() }
    }

    /// Appends a command; returns `self` so submissions chain.
    pub fn enqueue(&mut self, command: Command) -> &mut Self {
        self.queue.push(command);
        self
    }

    /// Number of commands waiting for the next commit.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Flushes every queued command in order.
    pub fn commit(&mut self) {
        for command in self.queue.drain(..) {
            command.execute();
        }
    }

    /// Commits and waits until the device is idle.
    pub fn synchronize(&mut self) {
        self.commit();
        // the reference executor runs commands inline, so the commit is the
        // completion point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn commands_run_in_submission_order() {
        let log = Arc::new(AtomicU32::new(0));
        let mut stream = Stream::new();
        for i in 1..=3u32 {
            let log = Arc::clone(&log);
            stream.enqueue(Command::new(move || {
                // shift in each id; order-sensitive
                log.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v * 10 + i))
                    .unwrap();
            }));
        }
        assert_eq!(stream.pending(), 3);
        stream.synchronize();
        assert_eq!(log.load(Ordering::SeqCst), 123);
        assert_eq!(stream.pending(), 0);
    }
}
