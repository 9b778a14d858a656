/// Progress surface for kernel operations. Implementations decide how to
/// render; the kernel never prints directly.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that discards everything. Useful for tests and embedded use.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reporter_accepts_all_levels() {
        let mut reporter = NullReporter;
        reporter.info("i");
        reporter.warn("w");
        reporter.error("e");
    }
}
