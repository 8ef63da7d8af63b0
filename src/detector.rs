use crate::config::DetectionConfig;
use crate::model::{Feed, Settings};
use crate::motion::MotionPipeline;
use crate::process::Purpose;
use crate::resolver::ResolvedSource;
use crate::supervisor::{FeedSupervisor, Workload};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub type DetectionSupervisor = FeedSupervisor<MotionDetector>;

/// Low-rate, downscaled scene-change detector. Frames that pass the `select`
/// filter are logged by `showinfo`, and each such line is a motion trigger.
pub struct MotionDetector {
    config: DetectionConfig,
    pipeline: Arc<MotionPipeline>,
}

impl MotionDetector {
    pub fn new(config: DetectionConfig, pipeline: Arc<MotionPipeline>) -> Self {
        Self { config, pipeline }
    }

    pub fn pipeline(&self) -> &Arc<MotionPipeline> {
        &self.pipeline
    }
}

#[async_trait]
impl Workload for MotionDetector {
    const PURPOSE: Purpose = Purpose::Detection;
    const LABEL: &'static str = "Detector";

    async fn prepare(
        &self,
        feed: &Feed,
        settings: &Settings,
        source: &ResolvedSource,
    ) -> anyhow::Result<Vec<String>> {
        let threshold = self.config.thresholds.for_level(settings.motion_sensitivity);
        info!(
            "[{}] detection sensitivity {:?} (threshold {})",
            feed.name, settings.motion_sensitivity, threshold
        );

        let mut args = source.input_args();
        args.extend([
            "-r".to_string(),
            self.config.frame_rate.to_string(),
            "-i".to_string(),
            source.input(),
            "-an".to_string(),
            "-vf".to_string(),
            format!(
                "fps={},scale={}:-2,select=gt(scene\\,{}),showinfo",
                self.config.frame_rate, self.config.scale_width, threshold
            ),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ]);
        Ok(args)
    }

    fn retain_feeds(&self, desired: &HashSet<i64>) {
        self.pipeline.retain_feeds(desired);
    }

    fn on_diagnostic(&self, feed: &Feed, line: &str) {
        if !line.contains(&self.config.marker) {
            return;
        }
        // Never block the stderr reader.
        let pipeline = self.pipeline.clone();
        let feed = feed.clone();
        tokio::spawn(async move {
            let outcome = pipeline.handle(&feed).await;
            debug!("[{}] motion outcome: {:?}", feed.name, outcome);
        });
    }
}
