use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const BAR_LEN: u64 = 1000;

/// Last-value-wins progress channel; the observer may skip intermediate values.
pub fn channel() -> (watch::Sender<f64>, watch::Receiver<f64>) {
    watch::channel(0.0)
}

/// Publish a completion fraction, clamped to `[0, 1]`. Never blocks and never
/// fails, even with no observer attached.
pub fn publish(tx: &watch::Sender<f64>, fraction: f64) {
    let value = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    tx.send_replace(value);
}

/// Draw a terminal bar until the sending side is dropped.
pub fn spawn_observer(mut rx: watch::Receiver<f64>, label: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = ProgressBar::new(BAR_LEN);
        let style = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}%")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(label);

        while rx.changed().await.is_ok() {
            let fraction = *rx.borrow_and_update();
            pb.set_position((fraction * BAR_LEN as f64).round() as u64);
        }
        pb.finish_and_clear();
    })
}
