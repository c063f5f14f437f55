use mailspool_tracing::traced;

#[traced]
fn plain(value: u32) -> u32 {
    value + 1
}

#[traced(timing(precision = "us"))]
fn timed(values: &[u32]) -> u32 {
    values.iter().sum()
}

struct Counter {
    start: u32,
}

impl Counter {
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    async fn bump(&self, by: u32) -> u32 {
        tokio::task::yield_now().await;
        self.start + by
    }
}

#[test]
fn sync_functions_keep_their_result() {
    assert_eq!(plain(1), 2);
    assert_eq!(timed(&[1, 2, 3]), 6);
}

#[tokio::test]
async fn instrumented_methods_keep_their_result() {
    let counter = Counter { start: 40 };

    assert_eq!(counter.bump(2).await, 42);
}
