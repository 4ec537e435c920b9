//! Template engine based on MiniJinja

use std::sync::Arc;

use indexmap::IndexMap;
use minijinja::{Environment, Value};
use rudder_core::chart::TEMPLATES_DIR;
use rudder_core::{Chart, RenderContext, Values};

use crate::error::{Result, TemplateError};
use crate::filters;

/// Read access to live cluster objects for the `lookup` template function
pub trait Lookup: Send + Sync {
    /// Fetch one object (`name` set) or a list (`name` empty, returned as
    /// `{"items": [...]}`). A missing object is an empty mapping, not an error.
    fn lookup(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<serde_json::Value, String>;
}

/// Lookup that never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLookup;

impl Lookup for NoLookup {
    fn lookup(&self, _: &str, _: &str, _: &str, _: &str) -> std::result::Result<serde_json::Value, String> {
        Ok(serde_json::json!({}))
    }
}

/// Renders a chart tree into `path -> text`
///
/// Paths are `<chart path>/templates/<file>`; sub-charts live under
/// `<parent path>/charts/<name>`. Output keeps template declaration order,
/// parents before their sub-charts.
pub trait Renderer: Send + Sync {
    fn render(&self, chart: &Chart, context: &RenderContext) -> Result<IndexMap<String, String>>;

    /// Same as `render`, with `lookup` answering from the cluster
    fn render_with_lookup(
        &self,
        chart: &Chart,
        context: &RenderContext,
        lookup: Arc<dyn Lookup>,
    ) -> Result<IndexMap<String, String>>;
}

/// Template engine builder
pub struct EngineBuilder {
    strict_mode: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { strict_mode: true }
    }

    /// Set strict mode (fail on undefined variables)
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.strict_mode)
    }
}

/// The template engine
#[derive(Debug, Clone)]
pub struct Engine {
    strict_mode: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

/// One template of the tree with the context it renders under
struct Unit<'a> {
    name: String,
    source: &'a str,
    base_path: String,
    context: RenderContext,
}

impl Engine {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Create a configured MiniJinja environment
    fn create_environment(&self, lookup: Option<Arc<dyn Lookup>>) -> Environment<'static> {
        let mut env = Environment::new();

        if self.strict_mode {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        } else {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        }

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("squote", filters::squote);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("indent", filters::indent);
        env.add_filter("required", filters::required);
        env.add_filter("empty", filters::empty);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimprefix", filters::trimprefix);
        env.add_filter("trimsuffix", filters::trimsuffix);
        env.add_filter("semver_match", filters::semver_match);

        env.add_function("fail", filters::fail);

        match lookup {
            Some(lookup) => {
                env.add_function(
                    "lookup",
                    move |api_version: String, kind: String, namespace: String, name: String| {
                        lookup
                            .lookup(&api_version, &kind, &namespace, &name)
                            .map(|found| Value::from_serialize(&found))
                            .map_err(|e| {
                                minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e)
                            })
                    },
                );
            }
            None => env.add_function("lookup", filters::lookup_offline),
        }

        env
    }

    /// Render a single template string
    pub fn render_string(
        &self,
        template: &str,
        context: &RenderContext,
        template_name: &str,
    ) -> Result<String> {
        let mut env = self.create_environment(None);
        env.add_template_owned(template_name.to_string(), template.to_string())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let tmpl = env
            .get_template(template_name)
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        Ok(tmpl
            .render(Self::template_context(context))
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?)
    }

    fn template_context(context: &RenderContext) -> Value {
        minijinja::context! {
            values => &context.values,
            release => &context.release,
            chart => &context.chart,
            capabilities => &context.capabilities,
            template => &context.template,
        }
    }

    /// Flatten the chart tree into render units, scoping values per sub-chart
    fn collect_units<'a>(
        chart: &'a Chart,
        values: &Values,
        context: &RenderContext,
        units: &mut Vec<Unit<'a>>,
    ) {
        let path = chart.full_path();
        let base_path = format!("{}/{}", path, TEMPLATES_DIR);

        for file in &chart.templates {
            units.push(Unit {
                name: format!("{}/{}", path, file.name),
                source: &file.data,
                base_path: base_path.clone(),
                context: context.clone(),
            });
        }

        for dep in &chart.dependencies {
            let scoped = Values::for_subchart(&dep.values, values, dep.name());
            let dep_context = context.for_subchart(scoped.clone(), &dep.metadata);
            Self::collect_units(dep, &scoped, &dep_context, units);
        }
    }

    fn render_tree(
        &self,
        chart: &Chart,
        context: &RenderContext,
        lookup: Option<Arc<dyn Lookup>>,
    ) -> Result<IndexMap<String, String>> {
        // chart defaults under the caller's values
        let mut values = chart.values.clone();
        values.merge(&Values(context.values.clone()));

        let mut root_context = context.clone();
        root_context.values = values.inner().clone();

        let mut units = Vec::new();
        Self::collect_units(chart, &values, &root_context, &mut units);

        let mut env = self.create_environment(lookup);
        for unit in &units {
            env.add_template_owned(unit.name.clone(), unit.source.to_string())
                .map_err(|e| TemplateError::from_minijinja(e, &unit.name, unit.source))?;
        }

        let mut rendered = IndexMap::with_capacity(units.len());
        for unit in &units {
            // partials only provide macros to other templates
            if is_partial(&unit.name) {
                continue;
            }

            let tmpl = env
                .get_template(&unit.name)
                .map_err(|e| TemplateError::from_minijinja(e, &unit.name, unit.source))?;

            let ctx = unit.context.clone().with_template(&unit.name, &unit.base_path);
            let output = tmpl
                .render(Self::template_context(&ctx))
                .map_err(|e| TemplateError::from_minijinja(e, &unit.name, unit.source))?;

            tracing::debug!(template = %unit.name, bytes = output.len(), "rendered template");
            rendered.insert(unit.name.clone(), output);
        }

        Ok(rendered)
    }
}

fn is_partial(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|base| base.starts_with('_'))
}

impl Renderer for Engine {
    fn render(&self, chart: &Chart, context: &RenderContext) -> Result<IndexMap<String, String>> {
        self.render_tree(chart, context, None)
    }

    fn render_with_lookup(
        &self,
        chart: &Chart,
        context: &RenderContext,
        lookup: Arc<dyn Lookup>,
    ) -> Result<IndexMap<String, String>> {
        self.render_tree(chart, context, Some(lookup))
    }
}
