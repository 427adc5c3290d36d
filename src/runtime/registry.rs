use super::{FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::Codec;
use crate::{ActivityError, OrchestrationContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable name → orchestrator map shared by the runtime.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn OrchestrationHandler>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn list_orchestration_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, Arc<dyn OrchestrationHandler>>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    fn insert(mut self, name: String, handler: Arc<dyn OrchestrationHandler>) -> Self {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate orchestration registration: {name}"));
            return self;
        }
        self.map.insert(name, handler);
        self
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)))
    }

    /// Register an orchestrator over serde types; input and output are JSON encoded.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)))
    }

    /// Build, ignoring duplicate registrations (the first one wins).
    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

/// An activity implementation invoked by the dispatcher.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
    errors: Vec<String>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }
}

impl ActivityRegistryBuilder {
    /// Register an activity whose `Err(String)` is a permanent failure.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_fallible(name, move |input: String| {
            let fut = f(input);
            async move { fut.await.map_err(ActivityError::Failed) }
        })
    }

    /// Register an activity that can ask for a retry with `ActivityError::Transient`.
    pub fn register_fallible<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate activity registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnActivity(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f(input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        })
    }

    /// Build, ignoring duplicate registrations (the first one wins).
    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<ActivityRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}
