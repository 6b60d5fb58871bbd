//! Custom bind functions: `::level(...)`, `::code(...)` and `::text(...)`.
//!
//! Permission and code names are resolved against a [`DescriptorIndex`]
//! built once when the service starts. Resolution is lenient: trailing dotted
//! segments are stripped from the name one at a time and looked up as inner
//! descriptors of whatever base name matches.

use crate::db::binds::FunctionArg;
use crate::error::{SqlError, SqlResult};
use crate::models::{BindBase, Value, bind::lookup_input};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Field holding the id of a code or code type.
pub const ID_FIELD: &str = "ID";

const LEVEL_SEPARATOR: &str = ".LEVEL_";

/// A named type known to the bind functions: a permission, code or code type.
///
/// Carries its constant fields (`ID`, `LEVEL_*`) and nested descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    qualified_name: String,
    fields: BTreeMap<String, Value>,
    inner: BTreeMap<String, Arc<Descriptor>>,
}

impl Descriptor {
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            fields: BTreeMap::new(),
            inner: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Nest `inner` under its simple name.
    pub fn with_inner(mut self, inner: Descriptor) -> Self {
        self.inner
            .insert(inner.simple_name().to_string(), Arc::new(inner));
        self
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn simple_name(&self) -> &str {
        self.qualified_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.qualified_name)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Walk a dotted path of inner descriptor names.
    pub fn inner_path(&self, path: &str) -> Option<Arc<Descriptor>> {
        let mut segments = path.split('.');
        let first = self.inner.get(segments.next()?)?.clone();
        segments.try_fold(first, |current, segment| current.inner.get(segment).cloned())
    }
}

/// Descriptors by simple and qualified name.
#[derive(Debug, Default, Clone)]
pub struct DescriptorIndex {
    by_name: HashMap<String, Vec<Arc<Descriptor>>>,
}

impl DescriptorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its qualified and its simple name.
    /// Candidates sharing a name are tried in registration order.
    pub fn register(&mut self, descriptor: Descriptor) {
        let descriptor = Arc::new(descriptor);
        let qualified = descriptor.qualified_name().to_string();
        let simple = descriptor.simple_name().to_string();
        self.by_name
            .entry(qualified.clone())
            .or_default()
            .push(descriptor.clone());
        if simple != qualified {
            self.by_name.entry(simple).or_default().push(descriptor);
        }
    }

    pub fn with(mut self, descriptor: Descriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Resolve `name` leniently; the first candidate that matches wins.
    pub fn resolve(&self, name: &str) -> Option<Arc<Descriptor>> {
        let name = name.trim();
        let mut base = name;
        let mut suffix: Option<String> = None;

        while !base.is_empty() {
            if let Some(candidates) = self.by_name.get(base) {
                let found = candidates.iter().find_map(|candidate| match &suffix {
                    None => Some(candidate.clone()),
                    Some(path) => candidate.inner_path(path),
                });
                if found.is_some() {
                    return found;
                }
            }
            let Some((head, segment)) = base.rsplit_once('.') else {
                break;
            };
            suffix = Some(match suffix {
                None => segment.to_string(),
                Some(path) => format!("{}.{}", segment, path),
            });
            base = head;
        }

        warn!(name = %name, "Cannot resolve descriptor name");
        None
    }
}

/// Grants permission levels for `::level(...)`.
pub trait AccessControl: Send + Sync {
    /// Level granted for `permission`, or `None` if unknown.
    fn permission_level(&self, permission: &Descriptor) -> Option<i64>;
}

/// Supplies localized texts for `::text(...)`.
pub trait TextProvider: Send + Sync {
    fn text(&self, key: &str, args: &[String]) -> Option<String>;
}

/// Evaluates a custom bind function to a bind value.
pub trait BindFunctionResolver: Send + Sync {
    fn resolve(&self, name: &str, args: &[FunctionArg], bases: &[BindBase]) -> SqlResult<Value>;
}

/// The built-in `level`, `code` and `text` functions.
#[derive(Clone, Default)]
pub struct BindFunctions {
    index: Arc<DescriptorIndex>,
    access_control: Option<Arc<dyn AccessControl>>,
    text_provider: Option<Arc<dyn TextProvider>>,
}

impl BindFunctions {
    pub fn new(index: DescriptorIndex) -> Self {
        Self {
            index: Arc::new(index),
            ..Self::default()
        }
    }

    pub fn with_access_control(mut self, access_control: Arc<dyn AccessControl>) -> Self {
        self.access_control = Some(access_control);
        self
    }

    pub fn with_text_provider(mut self, text_provider: Arc<dyn TextProvider>) -> Self {
        self.text_provider = Some(text_provider);
        self
    }

    pub fn index(&self) -> &DescriptorIndex {
        &self.index
    }

    fn single_name<'a>(function: &str, args: &'a [FunctionArg]) -> SqlResult<&'a str> {
        match args {
            [arg] => Ok(arg.text()),
            _ => Err(SqlError::illegal_argument(format!(
                "::{} expects exactly one argument, got {}",
                function,
                args.len()
            ))),
        }
    }

    fn level(&self, args: &[FunctionArg]) -> SqlResult<Value> {
        let arg = Self::single_name("level", args)?;
        let (permission_name, level_field) = match arg.find(LEVEL_SEPARATOR) {
            Some(i) => (&arg[..i], Some(&arg[i + 1..])),
            None => (arg, None),
        };
        let permission = self.index.resolve(permission_name).ok_or_else(|| {
            SqlError::illegal_argument(format!("Cannot find permission '{}'", permission_name))
        })?;

        if let Some(field) = level_field {
            return permission.field(field).cloned().ok_or_else(|| {
                SqlError::processing(format!(
                    "Permission '{}' has no level '{}'",
                    permission.qualified_name(),
                    field
                ))
            });
        }

        let access_control = self.access_control.as_ref().ok_or_else(|| {
            SqlError::processing(format!(
                "No access control available to resolve ::level({})",
                arg
            ))
        })?;
        Ok(access_control
            .permission_level(&permission)
            .map(Value::Int)
            .unwrap_or(Value::Null))
    }

    fn code(&self, args: &[FunctionArg]) -> SqlResult<Value> {
        let arg = Self::single_name("code", args)?;
        let code = self
            .index
            .resolve(arg)
            .ok_or_else(|| SqlError::processing(format!("Cannot find code '{}'", arg)))?;
        code.field(ID_FIELD).cloned().ok_or_else(|| {
            SqlError::processing(format!("Code '{}' has no {} field", arg, ID_FIELD))
        })
    }

    fn text(&self, args: &[FunctionArg], bases: &[BindBase]) -> SqlResult<Value> {
        let Some((key, rest)) = args.split_first() else {
            return Err(SqlError::illegal_argument(
                "::text expects a text key and optional arguments",
            ));
        };
        let provider = self.text_provider.as_ref().ok_or_else(|| {
            SqlError::processing(format!(
                "No text provider available to resolve ::text({})",
                key.text()
            ))
        })?;
        let key = arg_value(key, bases)?.to_string();
        let text_args = rest
            .iter()
            .map(|arg| arg_value(arg, bases).map(|v| v.to_string()))
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(provider
            .text(&key, &text_args)
            .map(Value::String)
            .unwrap_or(Value::Null))
    }
}

impl BindFunctionResolver for BindFunctions {
    fn resolve(&self, name: &str, args: &[FunctionArg], bases: &[BindBase]) -> SqlResult<Value> {
        debug!(function = name, args = args.len(), "Resolving bind function");
        match name {
            "level" => self.level(args),
            "code" => self.code(args),
            "text" => self.text(args, bases),
            other => Err(SqlError::illegal_argument(format!(
                "Unknown bind function '::{}'",
                other
            ))),
        }
    }
}

/// Value of a function argument: bind lookups for `:name`, the text otherwise.
pub fn arg_value(arg: &FunctionArg, bases: &[BindBase]) -> SqlResult<Value> {
    match arg {
        FunctionArg::Bind(name) => lookup_input(bases, name)
            .ok_or_else(|| SqlError::processing(format!("Cannot find bind ':{}'", name))),
        FunctionArg::Literal(s) | FunctionArg::Name(s) => Ok(Value::String(s.clone())),
    }
}
