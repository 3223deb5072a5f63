/// Runs blocking disk I/O from async context without stalling the
/// runtime. block_in_place is only legal on the multi-threaded runtime;
/// on a current-thread runtime (tests) the closure runs inline.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockingSpawner {
    allow_block_in_place: bool,
}

impl BlockingSpawner {
    pub fn run_blocking<F: FnOnce() -> R, R>(&self, f: F) -> R {
        if self.allow_block_in_place {
            return tokio::task::block_in_place(f);
        }
        f()
    }
}

impl Default for BlockingSpawner {
    fn default() -> Self {
        let allow_block_in_place = !matches!(
            tokio::runtime::Handle::current().runtime_flavor(),
            tokio::runtime::RuntimeFlavor::CurrentThread
        );
        Self {
            allow_block_in_place,
        }
    }
}
