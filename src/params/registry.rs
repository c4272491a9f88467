//! Category partitioned parameter store owned by one matcher

use crate::config::GlobalConfig;
use crate::error::{FinderError, FinderResult};

use super::codec;
use super::parameter::{ParamValue, Parameter};

pub type ParamDecl = (&'static str, Parameter);

/// Static description of one category: its backend choices and the
/// parameters each choice declares.
#[derive(Debug, Clone)]
pub struct CategorySpec {
    pub name: &'static str,
    pub backends: &'static [&'static str],
    /// Parameters present whatever the selected backend
    pub base: fn() -> Vec<ParamDecl>,
    pub backend_params: fn(&str) -> Vec<ParamDecl>,
    /// Parameters mirrored from a live algorithm instance; never calibratable
    pub read_only: &'static [&'static str],
}

pub(crate) fn no_params() -> Vec<ParamDecl> {
    Vec::new()
}

pub(crate) fn no_backend_params(_backend: &str) -> Vec<ParamDecl> {
    Vec::new()
}

#[derive(Debug, Clone)]
pub struct Category {
    backend: String,
    params: Vec<(String, Parameter)>,
}

impl Category {
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.params.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|p| p.value().as_f64())
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|p| p.value().as_i64())
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|p| p.value().as_bool())
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|p| p.value().as_str())
    }
}

impl PartialEq for Category {
    fn eq(&self, other: &Self) -> bool {
        self.backend == other.backend
            && self.params.len() == other.params.len()
            && self.params.iter().all(|(name, p)| other.get(name) == Some(p))
    }
}

/// One differing `(category, name)` pair reported by [`ParamRegistry::diff`].
/// `name` is `backend` when the backend selections differ.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDiff {
    pub category: String,
    pub name: String,
    pub left: Option<String>,
    pub right: Option<String>,
}

/// Ordered map from category name to its selected backend and parameters.
///
/// The parameter set of a category is always the category's base parameters
/// followed by the parameters of the selected backend.
#[derive(Debug, Clone)]
pub struct ParamRegistry {
    specs: Vec<CategorySpec>,
    categories: Vec<(String, Category)>,
}

impl ParamRegistry {
    /// Build a registry from category specs, selecting each category's
    /// process-wide default backend (or its first declared one).
    pub fn new(specs: Vec<CategorySpec>, config: &GlobalConfig) -> FinderResult<Self> {
        let mut registry = Self {
            specs,
            categories: Vec::new(),
        };
        let selections: Vec<(&'static str, String)> = registry
            .specs
            .iter()
            .map(|spec| {
                let backend = config
                    .default_backend(spec.name)
                    .unwrap_or(spec.backends[0])
                    .to_string();
                (spec.name, backend)
            })
            .collect();
        for (category, backend) in selections {
            registry.select_backend(category, &backend, true)?;
        }
        Ok(registry)
    }

    fn spec(&self, category: &str) -> FinderResult<&CategorySpec> {
        self.specs
            .iter()
            .find(|s| s.name == category)
            .ok_or_else(|| FinderError::UnknownCategory {
                category: category.to_string(),
            })
    }

    pub fn category(&self, category: &str) -> FinderResult<&Category> {
        self.categories
            .iter()
            .find(|(n, _)| n == category)
            .map(|(_, c)| c)
            .ok_or_else(|| FinderError::UnknownCategory {
                category: category.to_string(),
            })
    }

    fn category_mut(&mut self, category: &str) -> FinderResult<&mut Category> {
        self.categories
            .iter_mut()
            .find(|(n, _)| n == category)
            .map(|(_, c)| c)
            .ok_or_else(|| FinderError::UnknownCategory {
                category: category.to_string(),
            })
    }

    pub fn categories(&self) -> impl Iterator<Item = (&str, &Category)> {
        self.categories.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|(n, _)| n == category)
    }

    pub fn backend(&self, category: &str) -> FinderResult<&str> {
        Ok(self.category(category)?.backend())
    }

    pub fn choices(&self, category: &str) -> FinderResult<&'static [&'static str]> {
        Ok(self.spec(category)?.backends)
    }

    pub fn get(&self, category: &str, name: &str) -> FinderResult<&Parameter> {
        self.category(category)?
            .get(name)
            .ok_or_else(|| FinderError::UnknownParameter {
                category: category.to_string(),
                name: name.to_string(),
            })
    }

    pub fn value(&self, category: &str, name: &str) -> FinderResult<&ParamValue> {
        Ok(self.get(category, name)?.value())
    }

    pub fn float(&self, category: &str, name: &str) -> FinderResult<f64> {
        let value = self.value(category, name)?;
        value.as_f64().ok_or_else(|| kind_error(category, name, value, "float"))
    }

    pub fn int(&self, category: &str, name: &str) -> FinderResult<i64> {
        let value = self.value(category, name)?;
        value.as_i64().ok_or_else(|| kind_error(category, name, value, "int"))
    }

    pub fn flag(&self, category: &str, name: &str) -> FinderResult<bool> {
        let value = self.value(category, name)?;
        value.as_bool().ok_or_else(|| kind_error(category, name, value, "bool"))
    }

    pub fn text(&self, category: &str, name: &str) -> FinderResult<&str> {
        let value = self.value(category, name)?;
        value.as_str().ok_or_else(|| kind_error(category, name, value, "text"))
    }

    /// Explicit configuration: kind and range are enforced, `fixed` is not.
    pub fn set(&mut self, category: &str, name: &str, value: impl Into<ParamValue>) -> FinderResult<()> {
        self.set_checked(category, name, value.into(), false)
    }

    /// Calibrator mutation: like [`ParamRegistry::set`] but fixed parameters are rejected.
    pub fn calibrate_set(
        &mut self,
        category: &str,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> FinderResult<()> {
        self.set_checked(category, name, value.into(), true)
    }

    fn set_checked(
        &mut self,
        category: &str,
        name: &str,
        value: ParamValue,
        respect_fixed: bool,
    ) -> FinderResult<()> {
        let parameter = self
            .category_mut(category)?
            .get_mut(name)
            .ok_or_else(|| FinderError::UnknownParameter {
                category: category.to_string(),
                name: name.to_string(),
            })?;
        let invalid = |reason: String| FinderError::InvalidValue {
            category: category.to_string(),
            name: name.to_string(),
            value: value.to_string(),
            reason,
        };
        if respect_fixed && parameter.is_fixed() {
            return Err(invalid("parameter is fixed".to_string()));
        }
        parameter.set_value(value.clone()).map_err(invalid)?;
        log::trace!("{}/{} = {}", category, name, parameter.value());
        Ok(())
    }

    /// Replace a parameter with full metadata. The name must already exist.
    pub(crate) fn replace(&mut self, category: &str, name: &str, parameter: Parameter) -> FinderResult<()> {
        let slot = self
            .category_mut(category)?
            .get_mut(name)
            .ok_or_else(|| FinderError::UnknownParameter {
                category: category.to_string(),
                name: name.to_string(),
            })?;
        *slot = parameter;
        Ok(())
    }

    /// Select a backend for a category, regenerating its backend parameters.
    ///
    /// Base parameters keep their values unless `reset` is set or the category
    /// has never been populated.
    pub fn select_backend(&mut self, category: &str, backend: &str, reset: bool) -> FinderResult<()> {
        let spec = self.spec(category)?;
        if !spec.backends.contains(&backend) {
            return Err(FinderError::UnknownBackend {
                category: category.to_string(),
                backend: backend.to_string(),
                choices: spec.backends.iter().map(|b| b.to_string()).collect(),
            });
        }
        let base_decls = (spec.base)();
        let backend_decls = (spec.backend_params)(backend);

        let previous = self.category(category).ok().cloned();
        let mut params: Vec<(String, Parameter)> = Vec::with_capacity(base_decls.len() + backend_decls.len());
        for (name, default) in base_decls {
            let kept = match (&previous, reset) {
                (Some(prev), false) => prev.get(name).cloned(),
                _ => None,
            };
            params.push((name.to_string(), kept.unwrap_or(default)));
        }
        for (name, default) in backend_decls {
            params.push((name.to_string(), default));
        }

        let fresh = Category {
            backend: backend.to_string(),
            params,
        };
        match self.category_mut(category) {
            Ok(existing) => *existing = fresh,
            Err(_) => self.categories.push((category.to_string(), fresh)),
        }
        log::debug!("🔧 {} backend set to {} (reset: {})", category, backend, reset);
        Ok(())
    }

    /// Mark every parameter of a category as calibratable (`mark = true`) or not.
    /// Read-only parameters declared by the category stay fixed.
    pub fn can_calibrate(&mut self, category: &str, mark: bool) -> FinderResult<()> {
        let read_only = self.spec(category)?.read_only;
        let target = self.category_mut(category)?;
        for (name, parameter) in target.params.iter_mut() {
            let forced = read_only.contains(&name.as_str());
            parameter.set_fixed(!mark || forced);
        }
        Ok(())
    }

    /// Parameters a calibrator may change, in registry order.
    pub fn tunables(&self) -> Vec<(&str, &str, &Parameter)> {
        self.categories
            .iter()
            .flat_map(|(category, c)| {
                c.params
                    .iter()
                    .filter(|(_, p)| !p.is_fixed())
                    .map(move |(name, p)| (category.as_str(), name.as_str(), p))
            })
            .collect()
    }

    /// Differing `(category, name)` pairs between two registries.
    pub fn diff(&self, other: &ParamRegistry) -> Vec<ParamDiff> {
        let mut diffs = Vec::new();
        for (name, left) in self.categories() {
            match other.category(name) {
                Ok(right) => diff_category(name, left, right, &mut diffs),
                Err(_) => diffs.push(ParamDiff {
                    category: name.to_string(),
                    name: "backend".to_string(),
                    left: Some(left.backend().to_string()),
                    right: None,
                }),
            }
        }
        for (name, right) in other.categories() {
            if !self.has_category(name) {
                diffs.push(ParamDiff {
                    category: name.to_string(),
                    name: "backend".to_string(),
                    left: None,
                    right: Some(right.backend().to_string()),
                });
            }
        }
        diffs
    }

    pub fn serialize(&self) -> String {
        codec::serialize(self)
    }

    /// Load persisted text into this registry's schema. Every category in the
    /// text must exist here; categories absent from the text keep their values.
    /// On error the registry is left untouched.
    pub fn deserialize(&mut self, text: &str) -> FinderResult<()> {
        let sections = codec::parse_sections(text)?;
        let mut staged = self.clone();
        codec::apply_sections(&mut staged, &sections)?;
        *self = staged;
        Ok(())
    }
}

fn diff_category(category: &str, left: &Category, right: &Category, diffs: &mut Vec<ParamDiff>) {
    if left.backend() != right.backend() {
        diffs.push(ParamDiff {
            category: category.to_string(),
            name: "backend".to_string(),
            left: Some(left.backend().to_string()),
            right: Some(right.backend().to_string()),
        });
    }
    for (name, p) in left.params() {
        let other = right.get(name);
        if other != Some(p) {
            diffs.push(ParamDiff {
                category: category.to_string(),
                name: name.to_string(),
                left: Some(p.to_string()),
                right: other.map(|o| o.to_string()),
            });
        }
    }
    for (name, p) in right.params() {
        if left.get(name).is_none() {
            diffs.push(ParamDiff {
                category: category.to_string(),
                name: name.to_string(),
                left: None,
                right: Some(p.to_string()),
            });
        }
    }
}

fn kind_error(category: &str, name: &str, value: &ParamValue, expected: &str) -> FinderError {
    FinderError::InvalidValue {
        category: category.to_string(),
        name: name.to_string(),
        value: value.to_string(),
        reason: format!("expected a {} value", expected),
    }
}

impl PartialEq for ParamRegistry {
    fn eq(&self, other: &Self) -> bool {
        self.categories.len() == other.categories.len()
            && self
                .categories
                .iter()
                .all(|(name, c)| other.category(name).map(|o| o == c).unwrap_or(false))
    }
}
