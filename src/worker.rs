//! Dedicated analysis thread speaking a request/response protocol.
//!
//! Requests are handled one at a time in arrival order. Each `generate`
//! request yields zero or more `progress` responses followed by exactly one
//! `done` or `error`. Callers that supersede a request submit a new id and
//! drop responses for the old one.

use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::audio::analysis::{analyze_track, AnalysisSettings};
use crate::audio::context::AnalysisContext;
use crate::audio::features::Waveform;
use crate::chart::{build_chart, ChartData, Difficulty};
use crate::hint::TempoHintProvider;
use crate::patterns::PatternCatalog;

pub type RequestId = u64;

/// Declared and measured durations may differ by this much.
const DURATION_SLACK: f32 = 0.05;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    Generate(GenerateRequest),
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub id: RequestId,
    pub difficulty: Difficulty,
    pub sample_rate: u32,
    pub length: usize,
    pub duration: f32,
    pub channels: Vec<Vec<f32>>,
    #[serde(default)]
    pub perf_hint: Option<PerfHint>,
    #[serde(default = "default_use_tempo_hint")]
    pub use_tempo_hint: bool,
}

fn default_use_tempo_hint() -> bool { true }

/// Capabilities of the device the chart is generated on.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfHint {
    pub cores: u32,
    pub memory_gb: f32,
}

impl PerfHint {
    pub fn is_constrained(&self) -> bool {
        self.cores <= 2 || self.memory_gb < 2.0
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerResponse {
    Progress {
        id: RequestId,
        stage: String,
        progress: f32,
    },
    Done {
        id: RequestId,
        map: ChartData,
    },
    Error {
        id: RequestId,
        message: String,
    },
}

impl WorkerResponse {
    pub fn id(&self) -> RequestId {
        match self {
            WorkerResponse::Progress { id, .. }
            | WorkerResponse::Done { id, .. }
            | WorkerResponse::Error { id, .. } => *id,
        }
    }
}

pub struct Worker {
    requests: Sender<WorkerRequest>,
    responses: Receiver<WorkerResponse>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread. It owns its own analysis context.
    pub fn spawn(
        settings: AnalysisSettings,
        catalog: PatternCatalog,
        hint: Box<dyn TempoHintProvider>,
    ) -> std::io::Result<Self> {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<WorkerRequest>();
        let (resp_tx, resp_rx) = crossbeam_channel::unbounded::<WorkerResponse>();

        let handle = std::thread::Builder::new()
            .name("analysis-worker".into())
            .spawn(move || run(req_rx, resp_tx, settings, catalog, hint))?;

        Ok(Self {
            requests: req_tx,
            responses: resp_rx,
            handle: Some(handle),
        })
    }

    /// Queue a request. False when the worker has stopped.
    pub fn submit(&self, request: GenerateRequest) -> bool {
        self.requests.send(WorkerRequest::Generate(request)).is_ok()
    }

    pub fn responses(&self) -> &Receiver<WorkerResponse> {
        &self.responses
    }

    /// Submit and block for the final response, forwarding progress.
    /// Responses for other ids are discarded.
    pub fn generate(
        &self,
        request: GenerateRequest,
        mut on_progress: impl FnMut(&str, f32),
    ) -> Result<ChartData> {
        let id = request.id;
        if !self.submit(request) {
            bail!("Analysis worker has stopped");
        }
        loop {
            match self.responses().recv() {
                Ok(response) if response.id() != id => {
                    log::debug!("Discarding stale response for request {}", response.id());
                }
                Ok(WorkerResponse::Progress { stage, progress, .. }) => on_progress(&stage, progress),
                Ok(WorkerResponse::Done { map, .. }) => return Ok(map),
                Ok(WorkerResponse::Error { message, .. }) => bail!("Request {} failed: {}", id, message),
                Err(_) => bail!("Analysis worker exited before answering request {}", id),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.requests.send(WorkerRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    requests: Receiver<WorkerRequest>,
    responses: Sender<WorkerResponse>,
    settings: AnalysisSettings,
    catalog: PatternCatalog,
    hint: Box<dyn TempoHintProvider>,
) {
    let mut ctx = AnalysisContext::new();

    for request in requests.iter() {
        let request = match request {
            WorkerRequest::Shutdown => break,
            WorkerRequest::Generate(request) => request,
        };
        let id = request.id;
        log::info!("Request {}: {} difficulty", id, request.difficulty);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            generate(&mut ctx, &settings, &catalog, hint.as_ref(), request, &responses)
        }));
        let response = match outcome {
            Ok(Ok(map)) => WorkerResponse::Done { id, map },
            Ok(Err(e)) => WorkerResponse::Error {
                id,
                message: format!("{:#}", e),
            },
            Err(payload) => {
                // Caches may hold half-built state after a panic
                ctx = AnalysisContext::new();
                WorkerResponse::Error {
                    id,
                    message: panic_message(&*payload),
                }
            }
        };
        if let WorkerResponse::Error { message, .. } = &response {
            log::warn!("Request {} failed: {}", id, message);
        }
        if responses.send(response).is_err() {
            break;
        }
    }
    log::debug!("Analysis worker stopped");
}

fn generate(
    ctx: &mut AnalysisContext,
    settings: &AnalysisSettings,
    catalog: &PatternCatalog,
    hint: &dyn TempoHintProvider,
    request: GenerateRequest,
    responses: &Sender<WorkerResponse>,
) -> Result<ChartData> {
    let GenerateRequest {
        id,
        difficulty,
        sample_rate,
        length,
        duration,
        channels,
        perf_hint,
        use_tempo_hint,
    } = request;

    if let Some(bad) = channels.iter().position(|c| c.len() != length) {
        bail!(
            "channel {} has {} samples, request declares {}",
            bad,
            channels[bad].len(),
            length
        );
    }
    let waveform = Arc::new(Waveform::new(sample_rate, channels)?);
    if (waveform.duration - duration).abs() > DURATION_SLACK {
        log::warn!(
            "Declared duration {:.3}s differs from sample data ({:.3}s)",
            duration,
            waveform.duration
        );
    }

    let mut settings = match perf_hint {
        Some(perf) if perf.is_constrained() => {
            log::info!(
                "Constrained device ({} cores, {:.1} GB), using lighter analysis",
                perf.cores,
                perf.memory_gb
            );
            settings.lighter()
        }
        _ => settings.clone(),
    };
    if settings.sensitivity.is_none() {
        settings.target_onset_rate = difficulty.target_onset_rate();
    }

    let tempo_hint = if use_tempo_hint {
        hint.try_get_hint(Arc::clone(&waveform))
    } else {
        None
    };

    let analysis = analyze_track(ctx, &waveform, &settings, tempo_hint, &mut |stage, progress| {
        let _ = responses.send(WorkerResponse::Progress {
            id,
            stage: stage.to_string(),
            progress,
        });
    })?;

    Ok(build_chart(&analysis, catalog, difficulty))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("analysis panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("analysis panicked: {}", s)
    } else {
        "analysis panicked".into()
    }
}
