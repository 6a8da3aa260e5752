use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use raccord_contracts::runs::prompt_history::PromptHistoryWriter;

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsEvent {
    PromptRecorded {
        scene_id: String,
        model: String,
        prompt: String,
        outcome: String,
        note: Option<String>,
    },
    UsageRecorded {
        provider: String,
        resolution: String,
        total_images: u64,
    },
}

/// Sink for analytics events. Runs on the queue's worker thread.
pub trait AnalyticsRecorder: Send {
    fn record(&mut self, event: &AnalyticsEvent) -> Result<()>;
}

/// Appends prompts to `prompt_history.jsonl`; usage only goes to the log.
pub struct PromptHistoryRecorder {
    writer: PromptHistoryWriter,
}

impl PromptHistoryRecorder {
    pub fn new(writer: PromptHistoryWriter) -> Self {
        Self { writer }
    }
}

impl AnalyticsRecorder for PromptHistoryRecorder {
    fn record(&mut self, event: &AnalyticsEvent) -> Result<()> {
        match event {
            AnalyticsEvent::PromptRecorded {
                scene_id,
                model,
                prompt,
                outcome,
                note,
            } => {
                self.writer
                    .record(scene_id, model, prompt, outcome, note.as_deref())?;
            }
            AnalyticsEvent::UsageRecorded {
                provider,
                resolution,
                total_images,
            } => {
                tracing::debug!(%provider, %resolution, total_images, "usage recorded");
            }
        }
        Ok(())
    }
}

/// Recorder for runs without an artifact directory.
#[derive(Debug, Default)]
pub struct LogRecorder;

impl AnalyticsRecorder for LogRecorder {
    fn record(&mut self, event: &AnalyticsEvent) -> Result<()> {
        tracing::debug!(?event, "analytics");
        Ok(())
    }
}

/// Fire-and-forget queue drained by one worker thread. Generation never
/// waits on analytics and a failing recorder only logs.
pub struct AnalyticsQueue {
    sender: Mutex<Option<Sender<AnalyticsEvent>>>,
    worker: Mutex<Option<JoinHandle<u64>>>,
}

impl AnalyticsQueue {
    pub fn spawn(mut recorder: Box<dyn AnalyticsRecorder>) -> Self {
        let (sender, receiver) = mpsc::channel::<AnalyticsEvent>();
        let worker = thread::spawn(move || {
            let mut delivered = 0u64;
            for event in receiver {
                match recorder.record(&event) {
                    Ok(()) => delivered += 1,
                    Err(err) => tracing::warn!(error = %err, "analytics recorder failed"),
                }
            }
            delivered
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn send(&self, event: AnalyticsEvent) {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    tracing::warn!("analytics worker stopped; event dropped");
                }
            }
            None => tracing::debug!("analytics queue closed; event dropped"),
        }
    }

    /// Closes the queue and waits for queued events. Returns how many were
    /// recorded successfully; later calls return 0.
    pub fn shutdown(&self) -> u64 {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match worker.map(JoinHandle::join) {
            Some(Ok(delivered)) => delivered,
            Some(Err(_)) => {
                tracing::warn!("analytics worker panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for AnalyticsQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
