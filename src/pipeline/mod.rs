//! Mapping pipeline.
//!
//! The adapter's `map` and `post_map` produce a [`MappedEntity`]; a
//! [`Pipeline`] then runs an explicit, ordered list of [`MapStage`]s over it.
//! Each stage declares the stages it must run after, and [`Pipeline::new`]
//! rejects an order violating a declaration.

pub mod image;
pub mod stages;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::RunOptions;
use crate::error::Result;
use crate::types::{MappedEntity, PostMapKind};

use self::image::ImageProbe;
use self::stages::{ExpandFlatTimings, FilterTimings, InvalidImageFallback, MissingTimingsGuard};

/// Where in the flow a stage is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSite {
    Map,
    PostMap(PostMapKind),
}

/// Mutable state handed to every stage of one pipeline run.
#[derive(Debug)]
pub struct StageContext<'a> {
    pub scope_id: &'a str,
    pub call_site: CallSite,
    /// Images replaced because they could not be served.
    pub invalid_images: u32,
}

impl<'a> StageContext<'a> {
    pub fn new(scope_id: &'a str, call_site: CallSite) -> Self {
        Self {
            scope_id,
            call_site,
            invalid_images: 0,
        }
    }
}

#[async_trait]
pub trait MapStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stages that must appear earlier in the pipeline.
    fn runs_after(&self) -> &'static [&'static str] {
        &[]
    }

    fn applies_to(&self, _call_site: CallSite) -> bool {
        true
    }

    async fn apply(&self, entity: &mut MappedEntity, ctx: &mut StageContext<'_>) -> Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage '{stage}' must run after '{dependency}'")]
    OutOfOrder {
        stage: &'static str,
        dependency: &'static str,
    },

    #[error("stage '{0}' is registered twice")]
    Duplicate(&'static str),
}

/// Ordered list of stages.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn MapStage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|stage| stage.name()))
            .finish()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn MapStage>>) -> std::result::Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for stage in &stages {
            for &dependency in stage.runs_after() {
                if !seen.contains(dependency) {
                    return Err(PipelineError::OutOfOrder {
                        stage: stage.name(),
                        dependency,
                    });
                }
            }
            if !seen.insert(stage.name()) {
                return Err(PipelineError::Duplicate(stage.name()));
            }
        }
        Ok(Self { stages })
    }

    /// Image fallback, flat timing expansion, timing filter, missing-timings
    /// guard.
    pub fn standard(
        options: &RunOptions,
        probe: Arc<dyn ImageProbe>,
    ) -> std::result::Result<Self, PipelineError> {
        Self::new(vec![
            Arc::new(InvalidImageFallback::new(
                probe,
                options.no_bail_on_invalid_image,
                options.default_image_url.clone(),
            )) as Arc<dyn MapStage>,
            Arc::new(ExpandFlatTimings::new(
                options
                    .flat_timing_duration_secs
                    .and_then(chrono::Duration::try_seconds),
            )),
            Arc::new(FilterTimings),
            Arc::new(MissingTimingsGuard),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage applicable at the context's call site, in order.
    pub async fn run(&self, entity: &mut MappedEntity, ctx: &mut StageContext<'_>) -> Result<()> {
        for stage in &self.stages {
            if !stage.applies_to(ctx.call_site) {
                continue;
            }
            debug!(stage = stage.name(), scope = ctx.scope_id, "running stage");
            stage.apply(entity, ctx).await?;
        }
        Ok(())
    }
}
