// src/gcode/macros.rs - Macro table, invocation parsing and user-defined macros
use crate::config::MacroConfig;
use crate::gcode::executor::{ExecutorContext, ExecutorError};
use crate::gcode::parser::{arguments, keyword, parse_params};
use crate::gcode::template::{Template, TemplateError};
use crate::objects::PrinterObject;
use crate::print_job::PrintError;
use crate::printer::Printer;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MacroError {
    #[error("Cannot install {name}: rename target {target} is already defined")]
    RenameConflict { name: String, target: String },
    #[error("Template error in {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: TemplateError,
    },
    #[error("Missing required parameter {0}")]
    MissingParameter(String),
    #[error("Invalid value for {name}: '{value}'")]
    InvalidParameter { name: String, value: String },
    #[error("Unknown gcode_macro {0}")]
    UnknownMacro(String),
    #[error("Unknown variable '{variable}' for gcode_macro {name}")]
    UnknownVariable { name: String, variable: String },
    #[error("Unknown g-code state: {0}")]
    UnknownState(String),
    #[error("Printer is not connected")]
    NotConnected,
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Print(#[from] PrintError),
}

/// One call of a macro: where it runs and what it was given.
pub struct MacroInvocation {
    /// Sub-context owned by this invocation.
    pub context: Arc<ExecutorContext>,
    pub command: String,
    pub raw_params: String,
    pub positional: Vec<String>,
    pub params: BTreeMap<String, String>,
    /// State of every registered object at invocation time.
    pub objects: Map<String, Value>,
}

impl MacroInvocation {
    pub fn new(context: Arc<ExecutorContext>, line: &str, objects: Map<String, Value>) -> Self {
        let raw_params = arguments(line).to_string();
        Self {
            context,
            command: keyword(line).unwrap_or_default(),
            positional: raw_params.split_whitespace().map(str::to_string).collect(),
            params: parse_params(line),
            raw_params,
            objects,
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, MacroError> {
        self.param(key).ok_or_else(|| MacroError::MissingParameter(key.to_ascii_uppercase()))
    }

    pub fn param_f64(&self, key: &str) -> Result<Option<f64>, MacroError> {
        match self.param(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| MacroError::InvalidParameter {
                name: key.to_ascii_uppercase(),
                value: value.to_string(),
            }),
        }
    }
}

#[async_trait]
pub trait Macro: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        "G-Code macro"
    }

    async fn execute(&self, manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError>;
}

/// A macro defined in the `[macros]` config section.
#[derive(Debug)]
pub struct CustomMacro {
    name: String,
    description: String,
    template: Template,
    variables: Mutex<Map<String, Value>>,
}

impl CustomMacro {
    pub fn new(name: &str, config: &MacroConfig) -> Result<Self, MacroError> {
        let template = Template::parse(&config.gcode).map_err(|source| MacroError::Template {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            description: config.description.clone().unwrap_or_else(|| "G-Code macro".to_string()),
            template,
            variables: Mutex::new(config.variables.clone()),
        })
    }

    pub fn object_name(&self) -> String {
        format!("gcode_macro {}", self.name)
    }

    pub fn variables(&self) -> Map<String, Value> {
        self.variables.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Only variables declared in the config may be changed.
    pub fn set_variable(&self, variable: &str, value: Value) -> Result<(), MacroError> {
        let variable = variable.to_ascii_lowercase();
        let mut variables = self.variables.lock().unwrap_or_else(PoisonError::into_inner);
        match variables.get_mut(&variable) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(MacroError::UnknownVariable { name: self.name.clone(), variable }),
        }
    }

    pub fn render(&self, invocation: &MacroInvocation) -> Result<String, MacroError> {
        let mut context = self.variables();
        let params: Map<String, Value> = invocation
            .params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        context.insert("params".into(), Value::Object(params));
        context.insert("rawparams".into(), Value::String(invocation.raw_params.clone()));
        context.insert("printer".into(), Value::Object(invocation.objects.clone()));
        self.template
            .render(&Value::Object(context))
            .map_err(|source| MacroError::Template { name: self.name.clone(), source })
    }
}

#[async_trait]
impl Macro for CustomMacro {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, _manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError> {
        let script = self.render(&invocation)?;
        tracing::debug!("Running macro {}:\n{}", self.name, script);
        if let Some(pending) = invocation.context.queue_gcode(&script, false, true) {
            pending.wait().await?;
        }
        Ok(())
    }
}

impl PrinterObject for CustomMacro {
    fn name(&self) -> String {
        self.object_name()
    }

    fn query(&self) -> Map<String, Value> {
        self.variables()
    }
}

pub struct MacroManager {
    printer: Weak<Printer>,
    table: RwLock<HashMap<String, Arc<dyn Macro>>>,
    custom: RwLock<BTreeMap<String, Arc<CustomMacro>>>,
}

impl MacroManager {
    pub fn new(printer: Weak<Printer>) -> Self {
        Self {
            printer,
            table: RwLock::new(HashMap::new()),
            custom: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn printer(&self) -> Result<Arc<Printer>, MacroError> {
        self.printer.upgrade().ok_or(MacroError::NotConnected)
    }

    pub fn register(&self, handler: Arc<dyn Macro>) {
        let name = handler.name().to_ascii_uppercase();
        self.table.write().unwrap_or_else(PoisonError::into_inner).insert(name, handler);
    }

    /// Installs a user macro. An existing macro of the same name is moved to
    /// `rename_existing` (or `<NAME>_BASE`); if that name is taken the table
    /// is left untouched.
    pub fn register_custom(&self, name: &str, config: &MacroConfig) -> Result<Arc<CustomMacro>, MacroError> {
        let name = name.trim().to_ascii_uppercase();
        let custom = Arc::new(CustomMacro::new(&name, config)?);

        {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            if table.contains_key(&name) {
                let target = config
                    .rename_existing
                    .as_deref()
                    .map(|t| t.trim().to_ascii_uppercase())
                    .unwrap_or_else(|| format!("{name}_BASE"));
                if table.contains_key(&target) {
                    return Err(MacroError::RenameConflict { name, target });
                }
                if let Some(existing) = table.remove(&name) {
                    tracing::info!("Renaming existing macro {} to {}", name, target);
                    table.insert(target, existing);
                }
            } else if let Some(target) = &config.rename_existing {
                tracing::warn!("{}: nothing to rename to {}", name, target);
            }
            table.insert(name.clone(), custom.clone());
        }

        self.custom.write().unwrap_or_else(PoisonError::into_inner).insert(name, custom.clone());
        Ok(custom)
    }

    /// Loads configured macros in name order; failures are logged and skipped.
    pub fn load(&self, configs: &BTreeMap<String, MacroConfig>) -> Vec<Arc<CustomMacro>> {
        let mut loaded = Vec::new();
        for (name, config) in configs {
            match self.register_custom(name, config) {
                Ok(custom) => {
                    tracing::info!("Loaded macro {}", name);
                    loaded.push(custom);
                }
                Err(e) => tracing::error!("Failed to load macro {}: {}", name, e),
            }
        }
        loaded
    }

    /// Handler for a request line, matched on its uppercased first token.
    pub fn find(&self, line: &str) -> Option<Arc<dyn Macro>> {
        let name = keyword(line)?;
        self.table.read().unwrap_or_else(PoisonError::into_inner).get(&name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.to_ascii_uppercase())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn custom_macro(&self, name: &str) -> Option<Arc<CustomMacro>> {
        self.custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_ascii_uppercase())
            .cloned()
    }

    pub fn custom_macros(&self) -> Vec<Arc<CustomMacro>> {
        self.custom.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::executor::Dispatch;

    struct Sink;
    impl Dispatch for Sink {
        fn dispatch(&self, _context: &Arc<ExecutorContext>, _line: &str) {}
    }

    struct Named(&'static str);

    #[async_trait]
    impl Macro for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _manager: &MacroManager, _invocation: MacroInvocation) -> Result<(), MacroError> {
            Ok(())
        }
    }

    fn macro_config(gcode: &str, rename: Option<&str>) -> MacroConfig {
        MacroConfig {
            gcode: gcode.to_string(),
            description: None,
            rename_existing: rename.map(str::to_string),
            variables: Map::new(),
        }
    }

    fn manager() -> MacroManager {
        let manager = MacroManager::new(Weak::new());
        manager.register(Arc::new(Named("PAUSE")));
        manager.register(Arc::new(Named("RESUME")));
        manager
    }

    #[test]
    fn lookup_uses_uppercased_first_token() {
        let manager = manager();
        assert_eq!(manager.find("pause X=1").unwrap().name(), "PAUSE");
        assert!(manager.find("G28").is_none());
        assert!(manager.find("").is_none());
    }

    #[test]
    fn override_renames_existing_to_base() {
        let manager = manager();
        manager.register_custom("pause", &macro_config("M117 paused", None)).unwrap();
        assert_eq!(manager.find("PAUSE").unwrap().description(), "G-Code macro");
        assert_eq!(manager.find("PAUSE_BASE").unwrap().name(), "PAUSE");
        assert!(manager.custom_macro("PAUSE").is_some());
    }

    #[test]
    fn colliding_rename_targets_leave_table_intact() {
        let manager = manager();
        manager.register_custom("PAUSE", &macro_config("PAUSE_BASE", None)).unwrap();
        let err = manager.register_custom("RESUME", &macro_config("M117", Some("PAUSE_BASE"))).unwrap_err();
        assert!(matches!(err, MacroError::RenameConflict { ref target, .. } if target == "PAUSE_BASE"));
        assert_eq!(manager.names(), ["PAUSE", "PAUSE_BASE", "RESUME"]);
        assert!(manager.custom_macro("RESUME").is_none());
        assert_eq!(manager.find("RESUME").unwrap().description(), "G-Code macro");
        assert_eq!(manager.find("PAUSE_BASE").unwrap().name(), "PAUSE");
    }

    #[test]
    fn load_skips_broken_templates() {
        let manager = manager();
        let mut configs = BTreeMap::new();
        configs.insert("BROKEN".to_string(), macro_config("G1 X{params.x", None));
        configs.insert("PARK".to_string(), macro_config("G1 X{params.x|default(0)}", None));
        let loaded = manager.load(&configs);
        assert_eq!(loaded.len(), 1);
        assert!(manager.contains("park"));
        assert!(!manager.contains("BROKEN"));
    }

    #[tokio::test]
    async fn invocation_parses_params_and_renders() {
        let sink: Arc<dyn Dispatch> = Arc::new(Sink);
        let context = ExecutorContext::new("main", Arc::downgrade(&sink));
        let mut config = macro_config("M104 S{params.temp} T{tool}", None);
        config.variables.insert("tool".into(), Value::from(1));
        let custom = CustomMacro::new("HEAT", &config).unwrap();

        let invocation = MacroInvocation::new(context, "heat TEMP=205 fast", Map::new());
        assert_eq!(invocation.command, "HEAT");
        assert_eq!(invocation.positional, ["TEMP=205", "fast"]);
        assert_eq!(invocation.require("temp").unwrap(), "205");
        assert!(matches!(invocation.require("speed"), Err(MacroError::MissingParameter(_))));
        assert_eq!(custom.render(&invocation).unwrap(), "M104 S205 T1");

        custom.set_variable("TOOL", Value::from(0)).unwrap();
        assert_eq!(custom.query()["tool"], Value::from(0));
        assert!(custom.set_variable("missing", Value::Null).is_err());
    }
}
