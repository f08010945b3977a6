// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function registry.
//!
//! Maps function names to their registrations. Names are unique across every
//! service of one client. A service's functions are frozen once its agent has
//! claimed the service, so running agents read the registry without
//! coordination beyond a shared read lock.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jsonschema::Validator;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::error::{Result, SdkError};
use crate::execution::{Authenticator, FunctionError, FunctionHandler};

const MAX_NAME_LEN: usize = 64;

/// Validate a service or function name.
///
/// Names are 1 to 64 characters of ASCII letters, digits, `_` or `-`, and
/// start with a letter.
pub fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let invalid = |reason| SdkError::InvalidName {
        kind,
        name: name.to_string(),
        reason,
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("must not be empty"));
    };
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("must be at most 64 characters"));
    }
    if !first.is_ascii_alphabetic() {
        return Err(invalid("must start with a letter"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("may only contain ASCII letters, digits, '_' and '-'"));
    }
    Ok(())
}

/// Cache hint forwarded to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Input paths whose values form the cache key.
    pub key_path: Vec<String>,
    pub ttl_seconds: u64,
}

/// Per-function hints forwarded to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count_on_stall: Option<u32>,
}

/// Compiled input schema.
///
/// Every schema form accepted at registration is normalized into this: the
/// JSON Schema document, its canonical string and a compiled validator.
pub struct InputSchema {
    document: Value,
    canonical: String,
    validator: Validator,
}

impl InputSchema {
    /// Check and compile a JSON Schema document for `function`.
    ///
    /// The root must describe an object: either `"type": "object"` or a local
    /// `$ref` to a definition that does.
    pub fn compile(function: &str, document: Value) -> Result<Self> {
        let invalid = |reason: String| SdkError::InvalidSchema {
            function: function.to_string(),
            reason,
        };

        if !document.is_object() {
            return Err(invalid("schema must be a JSON object".to_string()));
        }
        check_object_root(&document).map_err(invalid)?;

        let validator = Validator::new(&document).map_err(|e| invalid(e.to_string()))?;
        let canonical = document.to_string();

        Ok(Self {
            document,
            canonical,
            validator,
        })
    }

    /// Schema derived from a Rust type.
    pub fn of<T: JsonSchema>(function: &str) -> Result<Self> {
        Self::compile(function, schema_document::<T>(function)?)
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Canonical JSON string sent to the control plane.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Validate `instance`, collecting every error rather than the first.
    pub fn validate(&self, instance: &Value) -> std::result::Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", path, error)
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl std::fmt::Debug for InputSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSchema")
            .field("document", &self.document)
            .finish()
    }
}

fn schema_document<T: JsonSchema>(function: &str) -> Result<Value> {
    serde_json::to_value(schemars::schema_for!(T)).map_err(|e| SdkError::InvalidSchema {
        function: function.to_string(),
        reason: e.to_string(),
    })
}

fn check_object_root(document: &Value) -> std::result::Result<(), String> {
    if let Some(reference) = document.get("$ref").and_then(Value::as_str) {
        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| format!("only local references are supported, got '{}'", reference))?;
        let target = document
            .pointer(pointer)
            .ok_or_else(|| format!("reference '{}' does not resolve", reference))?;
        return if declares_object(target) {
            Ok(())
        } else {
            Err(format!("reference '{}' does not describe an object", reference))
        };
    }

    if declares_object(document) {
        Ok(())
    } else {
        Err("root schema must have \"type\": \"object\"".to_string())
    }
}

fn declares_object(schema: &Value) -> bool {
    schema.get("type").and_then(Value::as_str) == Some("object")
}

/// A function as supplied by the caller, before registration.
pub struct FunctionDefinition {
    name: String,
    schema: SchemaSource,
    handler: Arc<dyn FunctionHandler>,
    description: Option<String>,
    authenticate: Option<Arc<dyn Authenticator>>,
    config: FunctionConfig,
}

enum SchemaSource {
    Document(Value),
    Derived(std::result::Result<Value, String>),
}

impl FunctionDefinition {
    /// A function taking raw JSON input, validated against `schema`.
    pub fn new<H>(name: impl Into<String>, schema: Value, handler: H) -> Self
    where
        H: FunctionHandler + 'static,
    {
        Self {
            name: name.into(),
            schema: SchemaSource::Document(schema),
            handler: Arc::new(handler),
            description: None,
            authenticate: None,
            config: FunctionConfig::default(),
        }
    }

    /// A function with a typed input. The schema is derived from `T` and
    /// validated input is deserialized into it before the handler runs.
    pub fn typed<T, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        T: JsonSchema + DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, FunctionError>> + Send + 'static,
    {
        let name = name.into();
        let schema = serde_json::to_value(schemars::schema_for!(T)).map_err(|e| e.to_string());
        let handler = Arc::new(handler);

        let erased = move |input: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let typed: T = serde_json::from_value(input)
                    .map_err(|e| FunctionError::new("InvalidInput", e.to_string()))?;
                let output = (*handler)(typed).await?;
                serde_json::to_value(output)
                    .map_err(|e| FunctionError::new("SerializationError", e.to_string()))
            }
        };

        Self {
            name,
            schema: SchemaSource::Derived(schema),
            handler: Arc::new(erased),
            description: None,
            authenticate: None,
            config: FunctionConfig::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Require every call to pass `authenticator` first.
    pub fn with_authenticator<A>(mut self, authenticator: A) -> Self
    where
        A: Authenticator + 'static,
    {
        self.authenticate = Some(Arc::new(authenticator));
        self
    }

    pub fn with_config(mut self, config: FunctionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A registered function.
pub struct FunctionRegistration {
    pub name: String,
    pub service_name: String,
    pub handler: Arc<dyn FunctionHandler>,
    pub schema: InputSchema,
    pub authenticate: Option<Arc<dyn Authenticator>>,
    pub config: FunctionConfig,
    pub description: Option<String>,
}

impl std::fmt::Debug for FunctionRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistration")
            .field("name", &self.name)
            .field("service_name", &self.service_name)
            .field("schema", &self.schema)
            .field("authenticated", &self.authenticate.is_some())
            .field("config", &self.config)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    functions: HashMap<String, Arc<FunctionRegistration>>,
    /// Function names in registration order.
    order: Vec<String>,
    started: HashSet<String>,
}

/// Process-wide function registry shared by a client and its agents.
#[derive(Default)]
pub struct FunctionRegistry {
    state: RwLock<RegistryState>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a function under `service`.
    pub fn register(
        &self,
        service: &str,
        definition: FunctionDefinition,
    ) -> Result<Arc<FunctionRegistration>> {
        validate_name("service", service)?;
        validate_name("function", &definition.name)?;

        let document = match definition.schema {
            SchemaSource::Document(document) => document,
            SchemaSource::Derived(derived) => {
                derived.map_err(|reason| SdkError::InvalidSchema {
                    function: definition.name.clone(),
                    reason,
                })?
            }
        };

        let mut state = self.write();
        if state.started.contains(service) {
            return Err(SdkError::ServiceAlreadyStarted(service.to_string()));
        }
        if state.functions.contains_key(&definition.name) {
            return Err(SdkError::DuplicateName(definition.name));
        }

        let schema = InputSchema::compile(&definition.name, document)?;
        let registration = Arc::new(FunctionRegistration {
            name: definition.name.clone(),
            service_name: service.to_string(),
            handler: definition.handler,
            schema,
            authenticate: definition.authenticate,
            config: definition.config,
            description: definition.description,
        });

        state
            .functions
            .insert(definition.name.clone(), Arc::clone(&registration));
        state.order.push(definition.name);

        info!(
            function = %registration.name,
            service = %service,
            authenticated = registration.authenticate.is_some(),
            "Registered function"
        );
        Ok(registration)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<FunctionRegistration>> {
        self.read().functions.get(name).cloned()
    }

    /// Functions of `service` in registration order.
    pub fn list_by_service(&self, service: &str) -> Vec<Arc<FunctionRegistration>> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|name| state.functions.get(name))
            .filter(|registration| registration.service_name == service)
            .cloned()
            .collect()
    }

    /// Distinct services with at least one function, in first-registration order.
    pub fn services(&self) -> Vec<String> {
        let state = self.read();
        let mut seen = HashSet::new();
        state
            .order
            .iter()
            .filter_map(|name| state.functions.get(name))
            .filter(|registration| seen.insert(registration.service_name.clone()))
            .map(|registration| registration.service_name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `service` as having a running agent, freezing its functions.
    pub fn claim_service(&self, service: &str) -> Result<()> {
        if !self.write().started.insert(service.to_string()) {
            return Err(SdkError::ServiceAlreadyStarted(service.to_string()));
        }
        Ok(())
    }

    /// Release a claim made by [`FunctionRegistry::claim_service`].
    pub fn release_service(&self, service: &str) {
        self.write().started.remove(service);
    }

    pub fn is_started(&self, service: &str) -> bool {
        self.read().started.contains(service)
    }

    /// Services with a running agent.
    pub fn started_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.read().started.iter().cloned().collect();
        services.sort();
        services
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("FunctionRegistry")
            .field("functions", &state.order)
            .field("started", &state.started)
            .finish()
    }
}
