//! Impairment controllers.
//!
//! A controller owns the queueing side of one network interface and is
//! selected per profile through `spec.type`. All variants expose the same
//! operation set; the reconciler talks to the [`Controller`] enum only.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use netem_crd::ControllerKind;

use crate::{
    emitter::Emitter,
    error::{AgentError, AgentResult},
    profile::ProfileHandle,
};

pub mod builtin;
pub mod flexe;
pub mod script;

pub use builtin::BuiltinController;
pub use flexe::FlexeController;
pub use script::ScriptController;

/// Process-scoped fwmark counter, starting at 1000.
///
/// Marks are handed out monotonically and never recycled; the 32-bit
/// space outlives any realistic profile churn.
#[derive(Clone, Debug)]
pub struct MarkPool(Arc<AtomicU32>);

impl MarkPool {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(1000)))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MarkPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping of the profiles a controller currently drives.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: std::collections::HashMap<String, ProfileHandle>,
}

impl ProfileRegistry {
    pub fn insert_new(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        if self.profiles.contains_key(&profile.uid) {
            return Err(AgentError::DuplicateProfile(profile.name.clone()));
        }

        self.profiles.insert(profile.uid.clone(), profile.clone());
        Ok(())
    }

    pub fn replace(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        if !self.profiles.contains_key(&profile.uid) {
            return Err(AgentError::UnknownProfile(profile.name.clone()));
        }

        self.profiles.insert(profile.uid.clone(), profile.clone());
        Ok(())
    }

    pub fn remove(&mut self, profile: &ProfileHandle) -> AgentResult<ProfileHandle> {
        self.profiles
            .remove(&profile.uid)
            .ok_or_else(|| AgentError::UnknownProfile(profile.name.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProfileHandle> {
        self.profiles.values()
    }
}

/// Uniform operation set of every controller variant.
#[async_trait]
pub trait ImpairmentController {
    fn kind(&self) -> ControllerKind;

    /// Next fwmark from the shared counter.
    fn get_mark(&self) -> u32;

    fn is_empty(&self) -> bool;

    async fn add_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()>;

    async fn update_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()>;

    async fn remove_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()>;

    async fn deinit(&mut self) -> AgentResult<()>;
}

pub enum Controller<E> {
    Builtin(BuiltinController<E>),
    Script(ScriptController),
    Flexe(FlexeController),
}

impl<E: Emitter> Controller<E> {
    /// Construct the controller variant selected by the profile type.
    pub async fn create(
        kind: ControllerKind,
        interface: &str,
        emitter: Arc<E>,
        marks: MarkPool,
    ) -> AgentResult<Self> {
        match kind {
            ControllerKind::Builtin => Ok(Self::Builtin(
                BuiltinController::init(emitter, interface, marks).await?,
            )),
            ControllerKind::Script => {
                Ok(Self::Script(ScriptController::init(interface, marks).await?))
            }
            ControllerKind::Flexe => Ok(Self::Flexe(
                FlexeController::connect(interface, marks, flexe::FlexeOptions::from_env()).await?,
            )),
        }
    }
}

#[async_trait]
impl<E: Emitter> ImpairmentController for Controller<E> {
    fn kind(&self) -> ControllerKind {
        match self {
            Controller::Builtin(ctrl) => ctrl.kind(),
            Controller::Script(ctrl) => ctrl.kind(),
            Controller::Flexe(ctrl) => ctrl.kind(),
        }
    }

    fn get_mark(&self) -> u32 {
        match self {
            Controller::Builtin(ctrl) => ctrl.get_mark(),
            Controller::Script(ctrl) => ctrl.get_mark(),
            Controller::Flexe(ctrl) => ctrl.get_mark(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Controller::Builtin(ctrl) => ctrl.is_empty(),
            Controller::Script(ctrl) => ctrl.is_empty(),
            Controller::Flexe(ctrl) => ctrl.is_empty(),
        }
    }

    async fn add_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        match self {
            Controller::Builtin(ctrl) => ctrl.add_profile(profile).await,
            Controller::Script(ctrl) => ctrl.add_profile(profile).await,
            Controller::Flexe(ctrl) => ctrl.add_profile(profile).await,
        }
    }

    async fn update_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        match self {
            Controller::Builtin(ctrl) => ctrl.update_profile(profile).await,
            Controller::Script(ctrl) => ctrl.update_profile(profile).await,
            Controller::Flexe(ctrl) => ctrl.update_profile(profile).await,
        }
    }

    async fn remove_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        match self {
            Controller::Builtin(ctrl) => ctrl.remove_profile(profile).await,
            Controller::Script(ctrl) => ctrl.remove_profile(profile).await,
            Controller::Flexe(ctrl) => ctrl.remove_profile(profile).await,
        }
    }

    async fn deinit(&mut self) -> AgentResult<()> {
        match self {
            Controller::Builtin(ctrl) => ctrl.deinit().await,
            Controller::Script(ctrl) => ctrl.deinit().await,
            Controller::Flexe(ctrl) => ctrl.deinit().await,
        }
    }
}
