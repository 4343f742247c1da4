//! Step registry: a compile-time registered table of step bodies keyed by
//! `Object.function`, searched through the context's step packages.
//!
//! Overload resolution is explicit metadata: each registered body carries a
//! [`StepSignature`] with named argument descriptors. The registry also
//! holds [`ObjectSpec`] class descriptors used by the resolver to project
//! `{className, object}` maps into typed [`Value::Object`] records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metalus_types::{MetalusError, Result, StepOutcome, Value, ValueKind};

use crate::context::PipelineContext;

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// One declared argument of a step body or constructed object field.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    /// Declared kind; `None` accepts any value. Checked only when the
    /// `validateStepParameterTypes` global is set.
    pub kind: Option<ValueKind>,
    pub required: bool,
    pub default: Option<Value>,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            required: false,
            default: None,
        }
    }

    pub fn of_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Identity and argument metadata of a registered step body.
#[derive(Debug, Clone)]
pub struct StepSignature {
    /// Namespace prefix searched via the context's `step_packages`.
    pub package: String,
    pub object: String,
    pub function: String,
    pub args: Vec<ArgSpec>,
}

impl StepSignature {
    pub fn new(
        package: impl Into<String>,
        object: impl Into<String>,
        function: impl Into<String>,
        args: Vec<ArgSpec>,
    ) -> Self {
        Self {
            package: package.into(),
            object: object.into(),
            function: function.into(),
            args,
        }
    }

    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.name == name)
    }
}

/// A registered step body. The pipeline context is supplied on every
/// invocation — the `pipelineContext` injection of the declarative model.
#[async_trait]
pub trait StepFunction: Send + Sync {
    fn signature(&self) -> StepSignature;

    async fn invoke(
        &self,
        args: HashMap<String, Value>,
        context: &PipelineContext,
    ) -> Result<StepOutcome>;
}

impl std::fmt::Debug for dyn StepFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StepFunction").field(&self.signature()).finish()
    }
}

// ---------------------------------------------------------------------------
// Object projection descriptors
// ---------------------------------------------------------------------------

/// One field of a constructable class.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
    /// Nested class to project map (or list-of-map) values into.
    pub class_name: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: None,
            class_name: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn of_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }
}

/// A constructable class: fully-qualified name plus field descriptors.
#[derive(Debug, Clone)]
pub struct ObjectSpec {
    pub class_name: String,
    pub fields: Vec<FieldSpec>,
}

impl ObjectSpec {
    pub fn new(class_name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            class_name: class_name.into(),
            fields,
        }
    }
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

type OverloadTable = HashMap<String, Vec<Arc<dyn StepFunction>>>;

/// Registry of step bodies and constructable classes. Read-only after
/// construction and freely shared across executions.
#[derive(Default)]
pub struct StepRegistry {
    /// "package.Object" -> function -> overloads in registration order.
    objects: HashMap<String, OverloadTable>,
    classes: HashMap<String, ObjectSpec>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: impl StepFunction + 'static) {
        let signature = step.signature();
        let key = format!("{}.{}", signature.package, signature.object);
        self.objects
            .entry(key)
            .or_default()
            .entry(signature.function)
            .or_default()
            .push(Arc::new(step));
    }

    pub fn register_object(&mut self, spec: ObjectSpec) {
        self.classes.insert(spec.class_name.clone(), spec);
    }

    pub fn has_class(&self, class_name: &str) -> bool {
        self.classes.contains_key(class_name)
    }

    /// Resolve an `Object.function` reference against the package search
    /// list. The first package containing `Object` wins; among that
    /// object's overloads of `function`, the one with the most declared
    /// argument names present in `args` is selected (ties go to
    /// registration order).
    pub fn resolve(
        &self,
        packages: &[String],
        reference: &str,
        args: &HashMap<String, Value>,
    ) -> Result<Arc<dyn StepFunction>> {
        let (object, function) = reference.split_once('.').ok_or_else(|| {
            MetalusError::Config(format!(
                "step reference '{reference}' is not of the form Object.function"
            ))
        })?;

        for package in packages {
            let key = format!("{package}.{object}");
            if let Some(functions) = self.objects.get(&key) {
                let overloads = functions.get(function).ok_or_else(|| {
                    MetalusError::UnknownStepFunction {
                        reference: reference.to_string(),
                        packages: packages.to_vec(),
                    }
                })?;
                return Ok(select_overload(overloads, args));
            }
        }

        Err(MetalusError::UnknownStepFunction {
            reference: reference.to_string(),
            packages: packages.to_vec(),
        })
    }

    /// Fill declared defaults for omitted arguments and enforce required
    /// ones. Returns the frozen argument vector handed to the body.
    pub fn finalize_args(
        &self,
        signature: &StepSignature,
        mut args: HashMap<String, Value>,
        validate_kinds: bool,
    ) -> Result<HashMap<String, Value>> {
        for spec in &signature.args {
            if !args.contains_key(&spec.name) {
                if let Some(default) = &spec.default {
                    args.insert(spec.name.clone(), default.clone());
                }
            }
            let value = args.get(&spec.name).unwrap_or(&Value::NONE);
            if spec.required && value.is_none() {
                return Err(MetalusError::Mapping {
                    target: format!(
                        "{}.{}({})",
                        signature.object, signature.function, spec.name
                    ),
                    message: "missing required step input".into(),
                });
            }
            if validate_kinds && !value.is_none() {
                if let Some(declared) = spec.kind {
                    if !declared.accepts(value.kind()) {
                        return Err(MetalusError::Mapping {
                            target: format!(
                                "{}.{}({})",
                                signature.object, signature.function, spec.name
                            ),
                            message: format!(
                                "expected {} but found {}",
                                declared,
                                value.kind()
                            ),
                        });
                    }
                }
            }
        }
        Ok(args)
    }

    /// Project a field map into a typed object via its registered class
    /// descriptor. Nested classes (and lists of them) project recursively;
    /// missing optional fields receive absence, missing required fields
    /// fail the mapping.
    pub fn construct(
        &self,
        class_name: &str,
        fields: &HashMap<String, Value>,
    ) -> Result<Value> {
        let spec = self
            .classes
            .get(class_name)
            .ok_or_else(|| MetalusError::UnresolvedClass {
                class_name: class_name.to_string(),
            })?;

        let mut out = HashMap::new();
        for field in &spec.fields {
            let raw = match fields.get(&field.name) {
                Some(v) => v.clone(),
                None => field.default.clone().unwrap_or(Value::None),
            };

            let value = match (&field.class_name, raw) {
                (Some(nested), Value::Map(m)) => self.construct(nested, &m)?,
                (Some(nested), Value::List(items)) => Value::List(
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::Map(m) => self.construct(nested, &m),
                            other => Ok(other),
                        })
                        .collect::<Result<Vec<_>>>()?,
                ),
                (_, v) => v,
            };

            if field.required && value.is_none() {
                return Err(MetalusError::Mapping {
                    target: format!("{}.{}", class_name, field.name),
                    message: "missing required field".into(),
                });
            }
            out.insert(field.name.clone(), value);
        }

        Ok(Value::Object {
            class_name: class_name.to_string(),
            fields: out,
        })
    }
}

/// Overload with the largest count of declared argument names present in
/// the resolved argument map; first registered wins ties.
fn select_overload(
    overloads: &[Arc<dyn StepFunction>],
    args: &HashMap<String, Value>,
) -> Arc<dyn StepFunction> {
    let mut best = &overloads[0];
    let mut best_count = presence_count(&best.signature(), args);
    for candidate in &overloads[1..] {
        let count = presence_count(&candidate.signature(), args);
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best.clone()
}

fn presence_count(signature: &StepSignature, args: &HashMap<String, Value>) -> usize {
    signature
        .args
        .iter()
        .filter(|spec| args.contains_key(&spec.name))
        .count()
}
