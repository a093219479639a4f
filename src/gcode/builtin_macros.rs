// src/gcode/builtin_macros.rs - Macros every connection provides
use crate::gcode::macros::{Macro, MacroError, MacroInvocation, MacroManager};
use crate::gcode::state::RestoreOptions;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_STATE_NAME: &str = "default";

pub fn builtin_macros() -> Vec<Arc<dyn Macro>> {
    vec![
        Arc::new(Pause),
        Arc::new(Resume),
        Arc::new(CancelPrint),
        Arc::new(SdcardPrintFile),
        Arc::new(SdcardResetFile),
        Arc::new(SaveGcodeState),
        Arc::new(RestoreGcodeState),
        Arc::new(SetGcodeVariable),
        Arc::new(FirmwareRestart),
    ]
}

pub struct Pause;

#[async_trait]
impl Macro for Pause {
    fn name(&self) -> &str {
        "PAUSE"
    }

    fn description(&self) -> &str {
        "Pauses the current print"
    }

    async fn execute(&self, manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError> {
        let printer = manager.printer()?;
        printer.print_manager().pause(&invocation.context).await?;
        Ok(())
    }
}

pub struct Resume;

#[async_trait]
impl Macro for Resume {
    fn name(&self) -> &str {
        "RESUME"
    }

    fn description(&self) -> &str {
        "Resumes the print from a pause"
    }

    async fn execute(&self, manager: &MacroManager, _invocation: MacroInvocation) -> Result<(), MacroError> {
        manager.printer()?.print_manager().resume()?;
        Ok(())
    }
}

pub struct CancelPrint;

#[async_trait]
impl Macro for CancelPrint {
    fn name(&self) -> &str {
        "CANCEL_PRINT"
    }

    fn description(&self) -> &str {
        "Cancel the current print"
    }

    async fn execute(&self, manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError> {
        let printer = manager.printer()?;
        printer.print_manager().cancel(&invocation.context).await?;
        Ok(())
    }
}

pub struct SdcardPrintFile;

#[async_trait]
impl Macro for SdcardPrintFile {
    fn name(&self) -> &str {
        "SDCARD_PRINT_FILE"
    }

    fn description(&self) -> &str {
        "Loads a file and starts the print"
    }

    async fn execute(&self, manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError> {
        let filename = invocation.require("filename")?;
        let printer = manager.printer()?;
        let print_manager = printer.print_manager();
        print_manager.select_file(filename).await?;
        print_manager.start()?;
        Ok(())
    }
}

pub struct SdcardResetFile;

#[async_trait]
impl Macro for SdcardResetFile {
    fn name(&self) -> &str {
        "SDCARD_RESET_FILE"
    }

    fn description(&self) -> &str {
        "Clears a loaded file"
    }

    async fn execute(&self, manager: &MacroManager, _invocation: MacroInvocation) -> Result<(), MacroError> {
        manager.printer()?.print_manager().reset_file()?;
        Ok(())
    }
}

pub struct SaveGcodeState;

#[async_trait]
impl Macro for SaveGcodeState {
    fn name(&self) -> &str {
        "SAVE_GCODE_STATE"
    }

    fn description(&self) -> &str {
        "Save G-Code coordinate state"
    }

    async fn execute(&self, manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError> {
        let name = invocation.param("name").unwrap_or(DEFAULT_STATE_NAME);
        manager.printer()?.save_gcode_state(name);
        Ok(())
    }
}

pub struct RestoreGcodeState;

#[async_trait]
impl Macro for RestoreGcodeState {
    fn name(&self) -> &str {
        "RESTORE_GCODE_STATE"
    }

    fn description(&self) -> &str {
        "Restore a previously saved G-Code state"
    }

    async fn execute(&self, manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError> {
        let name = invocation.param("name").unwrap_or(DEFAULT_STATE_NAME);
        let printer = manager.printer()?;
        let saved = printer
            .saved_gcode_state(name)
            .ok_or_else(|| MacroError::UnknownState(name.to_string()))?;
        let options = RestoreOptions {
            restore_position: invocation.param_f64("move")?.is_some_and(|m| m != 0.0),
            move_speed: invocation.param_f64("move_speed")?,
        };
        printer.restore_gcode_state(&invocation.context, &saved, &options).await?;
        Ok(())
    }
}

pub struct SetGcodeVariable;

#[async_trait]
impl Macro for SetGcodeVariable {
    fn name(&self) -> &str {
        "SET_GCODE_VARIABLE"
    }

    fn description(&self) -> &str {
        "Set the value of a G-Code macro variable"
    }

    async fn execute(&self, manager: &MacroManager, invocation: MacroInvocation) -> Result<(), MacroError> {
        let macro_name = invocation.require("macro")?;
        let variable = invocation.require("variable")?;
        let raw = invocation.require("value")?;
        let custom = manager
            .custom_macro(macro_name)
            .ok_or_else(|| MacroError::UnknownMacro(macro_name.to_string()))?;
        // Values are JSON literals; anything else is kept as a plain string.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        custom.set_variable(variable, value)?;
        manager.printer()?.objects().emit(&custom.object_name());
        Ok(())
    }
}

pub struct FirmwareRestart;

#[async_trait]
impl Macro for FirmwareRestart {
    fn name(&self) -> &str {
        "FIRMWARE_RESTART"
    }

    fn description(&self) -> &str {
        "Drops the serial connection so it is re-established"
    }

    async fn execute(&self, manager: &MacroManager, _invocation: MacroInvocation) -> Result<(), MacroError> {
        let printer = manager.printer()?;
        tracing::warn!("FIRMWARE_RESTART requested, closing connection");
        printer.close();
        Ok(())
    }
}
