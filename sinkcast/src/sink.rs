//! Virtual combined sink lifecycle and default-output routing
//!
//! Every routing command is a soft failure: it is logged and the next step is
//! still attempted. The default output the session mutes is recorded in the
//! returned [`SinkHandle`] and restored from there on unload.

use tracing::{info, warn};

use crate::command::{run_soft, CommandLine, CommandRunner};

const PACTL: &str = "pactl";

/// Placeholder understood by pactl as "whatever the default sink is now"
pub const DEFAULT_SINK_ALIAS: &str = "@DEFAULT_SINK@";

/// Ownership record for the virtual sink
///
/// `module_id == 0` means this session did not load the module (it already
/// existed, or loading failed) and must not unload it. Not `Clone`: unloading
/// consumes the handle, so a module is released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct SinkHandle {
    pub module_id: u32,
    /// Default output active before the switch, if it could be read
    pub prior_default: Option<String>,
}

impl SinkHandle {
    pub fn unowned() -> Self {
        Self {
            module_id: 0,
            prior_default: None,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.module_id != 0
    }

    fn restore_target(&self) -> &str {
        self.prior_default.as_deref().unwrap_or(DEFAULT_SINK_ALIAS)
    }
}

/// Creates and removes the virtual sink through `pactl`
pub struct SinkManager<R> {
    runner: R,
    sink_name: String,
}

impl<R: CommandRunner> SinkManager<R> {
    pub fn new(runner: R, sink_name: impl Into<String>) -> Self {
        Self {
            runner,
            sink_name: sink_name.into(),
        }
    }

    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    /// Names of all sinks; empty if listing fails
    pub async fn list_sinks(&self) -> Vec<String> {
        let cmd = CommandLine::new(PACTL).args(["list", "sinks", "short"]);
        run_soft(&self.runner, &cmd)
            .await
            .map(|out| parse_sink_names(&out))
            .unwrap_or_default()
    }

    /// Whether a sink with our name is currently present
    pub async fn sink_exists(&self) -> bool {
        self.list_sinks().await.iter().any(|s| s == &self.sink_name)
    }

    /// Ensure the virtual sink exists and route default output to it
    ///
    /// Returns the id of the module this call loaded, or 0 if the sink was
    /// already present (or could not be loaded).
    pub async fn load(&self, initial_volume_percent: u8) -> SinkHandle {
        let mut handle = SinkHandle::unowned();

        handle.prior_default = self.current_default().await;
        let mut exists = self.sink_exists().await;

        if !exists {
            info!(sink = %self.sink_name, "Loading combined sink module");
            handle.module_id = self.load_module(handle.prior_default.as_deref()).await;
            exists = self.sink_exists().await;
        } else {
            info!(sink = %self.sink_name, "Sink already present, not taking ownership");
        }

        if exists {
            match handle.prior_default.as_deref() {
                Some(prior) if prior == self.sink_name => {
                    warn!(sink = %self.sink_name, "Sink is already the default output, not muting it");
                }
                _ => {
                    let cmd = CommandLine::new(PACTL)
                        .args(["set-sink-mute", handle.restore_target(), "true"]);
                    run_soft(&self.runner, &cmd).await;
                }
            }

            let cmd = CommandLine::new(PACTL).args([
                "set-sink-volume".to_string(),
                self.sink_name.clone(),
                format!("{}%", initial_volume_percent),
            ]);
            run_soft(&self.runner, &cmd).await;

            let cmd = CommandLine::new(PACTL).args(["set-default-sink", self.sink_name.as_str()]);
            run_soft(&self.runner, &cmd).await;
        }

        handle
    }

    /// Remove the module this session loaded and unmute the original output
    ///
    /// No commands are issued for an unowned handle.
    pub async fn unload(&self, handle: SinkHandle) {
        if !handle.is_owned() {
            return;
        }

        info!(module_id = handle.module_id, "Unloading combined sink module");
        let cmd = CommandLine::new(PACTL).args([
            "unload-module".to_string(),
            handle.module_id.to_string(),
        ]);
        run_soft(&self.runner, &cmd).await;

        let cmd = CommandLine::new(PACTL).args(["set-sink-mute", handle.restore_target(), "false"]);
        run_soft(&self.runner, &cmd).await;
    }

    async fn current_default(&self) -> Option<String> {
        let cmd = CommandLine::new(PACTL).arg("get-default-sink");
        run_soft(&self.runner, &cmd)
            .await
            .filter(|name| !name.is_empty())
    }

    async fn load_module(&self, master: Option<&str>) -> u32 {
        let cmd = CommandLine::new(PACTL).args([
            "load-module".to_string(),
            "module-combine-sink".to_string(),
            format!("sink_name={}", self.sink_name),
            format!("sink_properties=device.description={}", self.sink_name),
            format!("slaves={}", master.unwrap_or(DEFAULT_SINK_ALIAS)),
            "channels=2".to_string(),
        ]);

        let Some(output) = run_soft(&self.runner, &cmd).await else {
            return 0;
        };

        match output.trim().parse::<u32>() {
            Ok(id) => id,
            Err(e) => {
                warn!(output = %output, "Unexpected load-module output, sink not owned: {}", e);
                0
            }
        }
    }
}

/// Extract sink names (second column) from `pactl list sinks short`
pub fn parse_sink_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}
