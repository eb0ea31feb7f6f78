//! Fire-and-forget notification delivery.
//!
//! Jobs are queued on a bounded channel and handled by a fixed pool of
//! workers, so at most `max_concurrency` outbound calls run at once and a
//! slow transport never blocks the caller. When the queue is full the job is
//! dropped.

use std::{
    sync::Arc,
    thread,
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::{config::NotifyConfig, encoding::encode_scaled, telemetry};

/// Outbound alert transport (chat bot, push service, ...).
pub trait NotificationService: Send + Sync {
    fn name(&self) -> &str;

    fn send_text(&self, message: &str) -> anyhow::Result<()>;

    /// `jpeg` is an encoded, already downscaled image.
    fn send_image_with_caption(&self, jpeg: &[u8], caption: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationService for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn send_text(&self, message: &str) -> anyhow::Result<()> {
        info!(target: "notify", "{message}");
        Ok(())
    }

    fn send_image_with_caption(&self, jpeg: &[u8], caption: &str) -> anyhow::Result<()> {
        info!(target: "notify", bytes = jpeg.len(), "{caption}");
        Ok(())
    }
}

enum Job {
    Text(String),
    Image { frame: Arc<Frame>, caption: String },
}

pub struct NotificationDispatcher {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn start(
        service: Arc<dyn NotificationService>,
        config: &NotifyConfig,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(config.queue_depth.max(1));
        let mut workers = Vec::new();
        for index in 0..config.max_concurrency.max(1) {
            let rx = rx.clone();
            let service = service.clone();
            let (max_width, quality) = (config.image_max_width, config.jpeg_quality);
            let handle = telemetry::spawn_thread(format!("notify-{index}"), move || {
                run_worker(rx, service, max_width, quality)
            })?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Queue a text message. Returns `false` if it was dropped.
    pub fn send_text(&self, message: impl Into<String>) -> bool {
        self.enqueue(Job::Text(message.into()))
    }

    /// Queue a frame with a caption. Returns `false` if it was dropped.
    pub fn send_image(&self, frame: Arc<Frame>, caption: impl Into<String>) -> bool {
        self.enqueue(Job::Image {
            frame,
            caption: caption.into(),
        })
    }

    fn enqueue(&self, job: Job) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("notification queue full; dropping message");
                metrics::counter!("notify_dropped_total").increment(1);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("notification worker panicked");
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(rx: Receiver<Job>, service: Arc<dyn NotificationService>, max_width: u32, quality: u8) {
    for job in rx {
        let started = Instant::now();
        let result = match job {
            Job::Text(message) => service.send_text(&message),
            Job::Image { frame, caption } => match encode_scaled(&frame.image, max_width, quality) {
                Ok(jpeg) => service.send_image_with_caption(&jpeg, &caption),
                Err(err) => Err(err.into()),
            },
        };
        metrics::histogram!("notify_send_seconds").record(started.elapsed().as_secs_f64());
        match result {
            Ok(()) => debug!(service = service.name(), "notification delivered"),
            Err(err) => {
                warn!(service = service.name(), "notification failed: {err:#}");
                metrics::counter!("notify_failures_total", "service" => service.name().to_string())
                    .increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use image::RgbImage;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        texts: Mutex<Vec<String>>,
        images: Mutex<Vec<(usize, String)>>,
        failures: AtomicUsize,
    }

    impl NotificationService for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn send_text(&self, message: &str) -> anyhow::Result<()> {
            if message == "fail" {
                self.failures.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("transport down");
            }
            self.texts.lock().unwrap().push(message.to_string());
            Ok(())
        }

        fn send_image_with_caption(&self, jpeg: &[u8], caption: &str) -> anyhow::Result<()> {
            self.images.lock().unwrap().push((jpeg.len(), caption.to_string()));
            Ok(())
        }
    }

    #[test]
    fn jobs_are_delivered_and_failures_swallowed() {
        let service = Arc::new(Recorder::default());
        let dispatcher =
            NotificationDispatcher::start(service.clone(), &NotifyConfig::default()).unwrap();
        assert!(dispatcher.send_text("fail"));
        assert!(dispatcher.send_text("hello"));
        let frame = Arc::new(Frame::new(RgbImage::new(1280, 720), 1));
        assert!(dispatcher.send_image(frame, "caption"));
        dispatcher.shutdown();

        assert_eq!(*service.texts.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(service.failures.load(Ordering::SeqCst), 1);
        let images = service.images.lock().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].1, "caption");
        assert!(images[0].0 > 0);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        struct Slow;
        impl NotificationService for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            fn send_text(&self, _: &str) -> anyhow::Result<()> {
                thread::sleep(std::time::Duration::from_millis(200));
                Ok(())
            }
            fn send_image_with_caption(&self, _: &[u8], _: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let config = NotifyConfig {
            max_concurrency: 1,
            queue_depth: 1,
            ..NotifyConfig::default()
        };
        let dispatcher = NotificationDispatcher::start(Arc::new(Slow), &config).unwrap();
        let started = Instant::now();
        let accepted = (0..10).filter(|i| dispatcher.send_text(format!("m{i}"))).count();
        assert!(started.elapsed() < std::time::Duration::from_millis(150));
        assert!(accepted < 10);
    }
}
