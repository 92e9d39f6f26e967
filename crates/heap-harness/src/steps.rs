/// Numbered progress output of the harness.
#[derive(Debug, Default)]
pub(crate) struct Steps {
    current: usize,
    passed: usize,
}

impl Steps {
    pub(crate) fn begin(&mut self, title: &str) {
        self.current += 1;
        println!("{}. {title}", self.current);
    }

    pub(crate) fn pass(&mut self) {
        self.passed += 1;
        println!("OK\n");
    }

    pub(crate) fn passed(&self) -> usize {
        self.passed
    }
}
