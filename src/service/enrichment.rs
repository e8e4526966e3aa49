//! Enrichment Service - detection fan-out
//!
//! Routes each detection of a batch to its category pipeline, acquires the
//! models the category needs for the duration of that category's work, runs
//! every detection on its own task and assembles the results in input
//! order. Per-detection failures are collected, never raised.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::DynamicImage;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::routing::{Category, EnrichmentTask};
use super::types::*;
use crate::config::PipelinesConfig;
use crate::engine::{ModelHandle, ModelInput, ModelOutput, ModelPool, ScopedHandle};
use crate::error::{EnrichError, PoolError};
use crate::storage::{record_or_warn, AuditEvent, AuditSink, BatchSummary};
use crate::utils::image::{crop_region, crop_to};

/// Detection enrichment service
pub struct EnrichmentService {
    pool: Arc<ModelPool>,
    pipelines: PipelinesConfig,
    sink: Arc<dyn AuditSink>,
}

impl EnrichmentService {
    pub fn new(pool: Arc<ModelPool>, pipelines: PipelinesConfig, sink: Arc<dyn AuditSink>) -> Self {
        Self { pool, pipelines, sink }
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    pub fn pipelines(&self) -> &PipelinesConfig {
        &self.pipelines
    }

    /// Enrich a batch of detections.
    ///
    /// Only invalid input and structural pool errors (unknown or disabled
    /// model) fail the call. Everything else ends up in `errors`.
    pub async fn enrich_batch(
        &self,
        detections: &[Detection],
        images: Option<&ImageMap>,
    ) -> Result<EnrichmentResult, EnrichError> {
        if detections.is_empty() {
            return Ok(EnrichmentResult::default());
        }

        let start = Instant::now();
        validate_batch(detections)?;

        // Categories are independent; the first structural error cancels the
        // others, which releases whatever they had acquired.
        let (vehicle, person, pet) = tokio::try_join!(
            self.run_category(Category::Vehicle, detections, images),
            self.run_category(Category::Person, detections, images),
            self.run_category(Category::Pet, detections, images),
        )?;

        let mut result = EnrichmentResult {
            batch_id: Uuid::new_v4(),
            ..Default::default()
        };
        for partial in [vehicle, person, pet] {
            result.license_plates.extend(partial.license_plates);
            result.faces.extend(partial.faces);
            result.poses.extend(partial.poses);
            result.classifications.extend(partial.classifications);
            result.errors.extend(partial.errors);
        }
        result.processing_time_ms = start.elapsed().as_millis() as u64;

        info!(
            "Enriched batch {} ({} detections) in {}ms with {} errors",
            result.batch_id,
            detections.len(),
            result.processing_time_ms,
            result.errors.len()
        );

        record_or_warn(
            self.sink.as_ref(),
            AuditEvent::BatchCompleted(BatchSummary {
                batch_id: result.batch_id,
                detections: detections.len(),
                category_error_counts: result.error_counts(),
                processing_time_ms: result.processing_time_ms,
            }),
        )
        .await;

        Ok(result)
    }

    async fn run_category(
        &self,
        category: Category,
        detections: &[Detection],
        images: Option<&ImageMap>,
    ) -> Result<EnrichmentResult, EnrichError> {
        let mut outcome = EnrichmentResult::default();
        let config = self.pipelines.for_category(category);
        if !config.enabled {
            return Ok(outcome);
        }

        let members: Vec<&Detection> = detections
            .iter()
            .filter(|d| Category::from_class(&d.class_name) == Some(category))
            .collect();
        // Gate on the category as a whole; once it runs, every member runs
        if !members.iter().any(|d| d.confidence >= config.min_confidence) {
            return Ok(outcome);
        }

        let Some(images) = images else {
            outcome.errors.push(EnrichmentError {
                detection_id: None,
                category,
                task: None,
                kind: EnrichmentErrorKind::MissingImageReference,
                message: format!(
                    "No images supplied, skipped {} {} detections",
                    members.len(),
                    category
                ),
            });
            return Ok(outcome);
        };

        debug!("Running {} pipeline on {} detections", category, members.len());

        // Held until this function returns, on every path
        let (handles, failed) = self.acquire_models(category).await?;

        let mut runnable = Vec::new();
        for &task in category.tasks() {
            match task.models().iter().find_map(|m| failed.get(m)) {
                Some(message) => outcome.errors.push(EnrichmentError {
                    detection_id: None,
                    category,
                    task: Some(task),
                    kind: EnrichmentErrorKind::ModelLoadFailure,
                    message: message.clone(),
                }),
                None => runnable.push(task),
            }
        }
        if runnable.is_empty() {
            return Ok(outcome);
        }

        let models: Arc<HashMap<&'static str, ModelHandle>> = Arc::new(
            handles
                .iter()
                .map(|(name, handle)| (*name, handle.model().clone()))
                .collect(),
        );
        let runnable = Arc::new(runnable);
        let timeout = Duration::from_millis(config.timeout_ms);

        let mut prepared = Vec::with_capacity(members.len());
        let mut group = TaskGroup::default();
        for detection in &members {
            match prepare_job(category, detection, images) {
                Ok(job) => {
                    let models = models.clone();
                    let tasks = runnable.clone();
                    prepared.push(Prepared::Spawned(detection.id.clone()));
                    group.0.push(tokio::spawn(async move {
                        run_detection(category, job, &tasks, &models, timeout).await
                    }));
                }
                Err(error) => prepared.push(Prepared::Failed(error)),
            }
        }

        let mut spawned = group.0.iter_mut();
        for entry in prepared {
            match entry {
                Prepared::Failed(error) => outcome.errors.push(error),
                Prepared::Spawned(detection_id) => {
                    let Some(handle) = spawned.next() else {
                        break;
                    };
                    match handle.await {
                        Ok(done) => done.merge_into(&mut outcome),
                        Err(e) => outcome.errors.push(EnrichmentError {
                            detection_id: Some(detection_id),
                            category,
                            task: None,
                            kind: EnrichmentErrorKind::DetectionInferenceFailure,
                            message: format!("Detection task failed: {}", e),
                        }),
                    }
                }
            }
        }

        for error in &outcome.errors {
            warn!(
                "{} enrichment error for {:?} ({:?}): {}",
                category, error.detection_id, error.kind, error.message
            );
        }

        drop(handles);
        Ok(outcome)
    }

    /// Acquire every model the category uses. Load failures are returned
    /// per model so the tasks that do not need them can still run.
    async fn acquire_models(
        &self,
        category: Category,
    ) -> Result<(HashMap<&'static str, ScopedHandle>, HashMap<&'static str, String>), PoolError>
    {
        let mut handles = HashMap::new();
        let mut failed = HashMap::new();

        for model in category.models() {
            match self.pool.acquire(model).await {
                Ok(handle) => {
                    handles.insert(model, handle);
                }
                Err(e @ PoolError::LoadFailure { .. }) => {
                    warn!("Skipping {} tasks that need {}: {}", category, model, e);
                    failed.insert(model, e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        Ok((handles, failed))
    }
}

fn validate_batch(detections: &[Detection]) -> Result<(), EnrichError> {
    let mut seen = HashSet::with_capacity(detections.len());
    for detection in detections {
        detection
            .validate()
            .map_err(|reason| EnrichError::InvalidDetection {
                id: detection.id.clone(),
                reason,
            })?;
        if !seen.insert(detection.id.as_str()) {
            return Err(EnrichError::DuplicateDetection {
                id: detection.id.clone(),
            });
        }
    }
    Ok(())
}

enum Prepared {
    Spawned(String),
    Failed(EnrichmentError),
}

/// Spawned detection tasks, aborted if the batch is dropped before they finish
#[derive(Default)]
struct TaskGroup(Vec<JoinHandle<DetectionOutcome>>);

impl Drop for TaskGroup {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// The detection's region cut out of its source image
struct DetectionJob {
    detection_id: String,
    crop: DynamicImage,
    offset: (f32, f32),
}

fn prepare_job(
    category: Category,
    detection: &Detection,
    images: &ImageMap,
) -> Result<DetectionJob, EnrichmentError> {
    let fail = |kind, message: String| EnrichmentError {
        detection_id: Some(detection.id.clone()),
        category,
        task: None,
        kind,
        message,
    };

    // A detection without a reference falls back to the only image supplied
    let image = match &detection.source_image_ref {
        Some(image_ref) => images.get(image_ref).ok_or_else(|| {
            fail(
                EnrichmentErrorKind::MissingImageReference,
                format!("Image '{}' was not supplied", image_ref),
            )
        })?,
        None if images.len() == 1 => images.values().next().ok_or_else(|| {
            fail(EnrichmentErrorKind::MissingImageReference, "No image supplied".to_string())
        })?,
        None => {
            return Err(fail(
                EnrichmentErrorKind::MissingImageReference,
                format!("No image reference and {} images supplied", images.len()),
            ))
        }
    };

    let b = &detection.bounding_box;
    let (crop, (left, top)) = crop_region(image, b.x1, b.y1, b.x2, b.y2).ok_or_else(|| {
        fail(
            EnrichmentErrorKind::DetectionInferenceFailure,
            "Bounding box lies outside the image".to_string(),
        )
    })?;

    Ok(DetectionJob {
        detection_id: detection.id.clone(),
        crop,
        offset: (left as f32, top as f32),
    })
}

enum SubResult {
    Plate(PlateReading),
    Face(FaceResult),
    Pose(PoseResult),
    Classification(ClassificationResult),
}

#[derive(Default)]
struct DetectionOutcome {
    results: Vec<SubResult>,
    errors: Vec<EnrichmentError>,
}

impl DetectionOutcome {
    fn merge_into(self, outcome: &mut EnrichmentResult) {
        for result in self.results {
            match result {
                SubResult::Plate(p) => outcome.license_plates.push(p),
                SubResult::Face(f) => outcome.faces.push(f),
                SubResult::Pose(p) => outcome.poses.push(p),
                SubResult::Classification(c) => outcome.classifications.push(c),
            }
        }
        outcome.errors.extend(self.errors);
    }
}

struct TaskFailure {
    kind: EnrichmentErrorKind,
    message: String,
}

impl TaskFailure {
    fn inference(message: impl Into<String>) -> Self {
        Self {
            kind: EnrichmentErrorKind::DetectionInferenceFailure,
            message: message.into(),
        }
    }

    fn unexpected(model: &str, expected: &str, got: &ModelOutput) -> Self {
        Self::inference(format!(
            "{} returned {} output, expected {}",
            model,
            got.kind(),
            expected
        ))
    }
}

async fn run_detection(
    category: Category,
    job: DetectionJob,
    tasks: &[EnrichmentTask],
    models: &HashMap<&'static str, ModelHandle>,
    timeout: Duration,
) -> DetectionOutcome {
    let mut outcome = DetectionOutcome::default();

    for &task in tasks {
        match run_task(task, &job, models, timeout).await {
            Ok(Some(result)) => outcome.results.push(result),
            Ok(None) => {}
            Err(failure) => outcome.errors.push(EnrichmentError {
                detection_id: Some(job.detection_id.clone()),
                category,
                task: Some(task),
                kind: failure.kind,
                message: failure.message,
            }),
        }
    }

    outcome
}

async fn infer(
    models: &HashMap<&'static str, ModelHandle>,
    name: &str,
    image: DynamicImage,
    timeout: Duration,
) -> Result<ModelOutput, TaskFailure> {
    let model = models
        .get(name)
        .ok_or_else(|| TaskFailure::inference(format!("Model {} was not acquired", name)))?;

    match tokio::time::timeout(timeout, model.infer(ModelInput::new(image))).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(TaskFailure::inference(format!("{} failed: {:#}", name, e))),
        Err(_) => Err(TaskFailure {
            kind: EnrichmentErrorKind::DetectionTimeout,
            message: format!("{} did not answer within {}ms", name, timeout.as_millis()),
        }),
    }
}

async fn run_task(
    task: EnrichmentTask,
    job: &DetectionJob,
    models: &HashMap<&'static str, ModelHandle>,
    timeout: Duration,
) -> Result<Option<SubResult>, TaskFailure> {
    let (dx, dy) = job.offset;
    let detection_id = job.detection_id.clone();

    match task {
        EnrichmentTask::LicensePlate => {
            let regions = match infer(models, "plate_detector", job.crop.clone(), timeout).await? {
                ModelOutput::Regions { regions } => regions,
                other => return Err(TaskFailure::unexpected("plate_detector", "regions", &other)),
            };
            // Regions come best first
            let Some(plate) = regions.first().copied() else {
                return Ok(None);
            };
            let Some((plate_crop, _)) = crop_to(&job.crop, &plate) else {
                return Ok(None);
            };

            match infer(models, "plate_ocr", plate_crop, timeout).await? {
                ModelOutput::Text { text, .. } if text.is_empty() => Ok(None),
                ModelOutput::Text { text, confidence } => Ok(Some(SubResult::Plate(PlateReading {
                    detection_id,
                    text,
                    confidence,
                    plate: plate.translate(dx, dy),
                }))),
                other => Err(TaskFailure::unexpected("plate_ocr", "text", &other)),
            }
        }
        EnrichmentTask::Face => {
            let name = task.models()[0];
            match infer(models, name, job.crop.clone(), timeout).await? {
                ModelOutput::Regions { regions } => Ok(Some(SubResult::Face(FaceResult {
                    detection_id,
                    faces: regions.iter().map(|r| r.translate(dx, dy)).collect(),
                }))),
                other => Err(TaskFailure::unexpected(name, "regions", &other)),
            }
        }
        EnrichmentTask::Pose => {
            let name = task.models()[0];
            match infer(models, name, job.crop.clone(), timeout).await? {
                ModelOutput::Keypoints { mut keypoints } => {
                    for k in &mut keypoints {
                        k.x += dx;
                        k.y += dy;
                    }
                    Ok(Some(SubResult::Pose(PoseResult { detection_id, keypoints })))
                }
                other => Err(TaskFailure::unexpected(name, "keypoints", &other)),
            }
        }
        EnrichmentTask::VehicleDamage | EnrichmentTask::Violence | EnrichmentTask::PetBreed => {
            let name = task.models()[0];
            match infer(models, name, job.crop.clone(), timeout).await? {
                ModelOutput::Classification { label, confidence } => {
                    Ok(Some(SubResult::Classification(ClassificationResult {
                        detection_id,
                        task,
                        label,
                        confidence,
                    })))
                }
                other => Err(TaskFailure::unexpected(name, "classification", &other)),
            }
        }
    }
}
