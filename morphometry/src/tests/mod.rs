use std::future::Future;
use std::time::Duration;


/// Bounds a pipeline run so a stuck worker fails the test instead of hanging it.
async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(300), future)
        .await
        .expect("pipeline run timed out")
}
