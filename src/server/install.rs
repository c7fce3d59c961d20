//! Self-update installation as a saga of privileged steps.
//!
//! Each step may carry a compensating command. When a required step fails,
//! the compensations of the steps that already completed run in reverse
//! order before the failure is reported.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::InstallSettings;
use crate::process::{CommandRunner, PrivilegedCommand};
use crate::protocol::Status;

/// One step of a [`Saga`].
#[derive(Debug, Clone)]
pub struct SagaStep {
    name: &'static str,
    action: PrivilegedCommand,
    compensation: Option<PrivilegedCommand>,
    on_failure: Status,
    best_effort: bool,
}

impl SagaStep {
    /// A required step: its failure aborts the saga with `on_failure`.
    pub fn new(name: &'static str, action: PrivilegedCommand, on_failure: Status) -> Self {
        Self {
            name,
            action,
            compensation: None,
            on_failure,
            best_effort: false,
        }
    }

    /// A step whose failure is logged and otherwise ignored.
    pub fn best_effort(name: &'static str, action: PrivilegedCommand) -> Self {
        Self {
            best_effort: true,
            ..Self::new(name, action, Status::Success)
        }
    }

    /// Undo this step with `compensation` if a later required step fails.
    #[must_use]
    pub fn compensate_with(mut self, compensation: PrivilegedCommand) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// An ordered list of steps executed with compensation on failure.
#[derive(Debug, Clone)]
pub struct Saga {
    steps: Vec<SagaStep>,
    on_rollback_failure: Status,
}

impl Saga {
    /// `on_rollback_failure` is reported when a compensation itself fails.
    pub const fn new(on_rollback_failure: Status) -> Self {
        Self {
            steps: Vec::new(),
            on_rollback_failure,
        }
    }

    #[must_use]
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    /// Run every step, each under `timeout`.
    pub async fn run<R: CommandRunner>(&self, runner: &R, timeout: Duration) -> Status {
        for (index, step) in self.steps.iter().enumerate() {
            let Err(err) = runner.run(&step.action, timeout).await else {
                info!(step = step.name, "install step done");
                continue;
            };

            if step.best_effort {
                warn!(step = step.name, "install step failed, continuing: {err}");
                continue;
            }

            error!(step = step.name, "install step failed: {err}");
            return if self.compensate(runner, timeout, index).await {
                step.on_failure
            } else {
                self.on_rollback_failure
            };
        }
        Status::Success
    }

    /// Undo the steps before `failed`, newest first. Returns whether every
    /// compensation succeeded.
    async fn compensate<R: CommandRunner>(
        &self,
        runner: &R,
        timeout: Duration,
        failed: usize,
    ) -> bool {
        let mut clean = true;
        for step in self.steps[..failed].iter().rev() {
            let Some(compensation) = &step.compensation else {
                continue;
            };
            match runner.run(compensation, timeout).await {
                Ok(_) => info!(step = step.name, "rolled back install step"),
                Err(err) => {
                    error!(step = step.name, "rollback of install step failed: {err}");
                    clean = false;
                }
            }
        }
        clean
    }
}

/// Build the install saga replacing `<install_dir>/<bundle>` with
/// `<staged_dir>/<bundle>`:
///
/// 1. remove a stale `<bundle>.bak` (`-1` on failure)
/// 2. move the live bundle to the backup (`-2`)
/// 3. move the staged bundle into place (`-3`, or `-4` if restoring the
///    backup fails too)
/// 4. remove the backup (failure only logged)
pub fn plan(settings: &InstallSettings, staged_dir: &Path, install_dir: &Path) -> Saga {
    let bundle = settings.bundle_name.as_str();
    let live = install_dir.join(bundle);
    let backup = install_dir.join(format!("{bundle}.bak"));
    let staged = staged_dir.join(bundle);

    let remove = |path: &Path| {
        PrivilegedCommand::new(&settings.rm).args([OsStr::new("-rf"), path.as_os_str()])
    };
    let rename = |from: &Path, to: &Path| {
        PrivilegedCommand::new(&settings.mv).args([from.as_os_str(), to.as_os_str()])
    };

    Saga::new(Status::RollbackFailed)
        .step(SagaStep::new(
            "remove stale backup",
            remove(&backup),
            Status::Failed,
        ))
        .step(
            SagaStep::new(
                "back up current install",
                rename(&live, &backup),
                Status::BackupFailed,
            )
            .compensate_with(rename(&backup, &live)),
        )
        .step(SagaStep::new(
            "move update into place",
            rename(&staged, &live),
            Status::InstallFailed,
        ))
        .step(SagaStep::best_effort("remove backup", remove(&backup)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::runner::tests::{MockRunner, exit_error};
    use crate::process::SystemRunner;
    use std::fs;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn settings() -> InstallSettings {
        InstallSettings::default()
    }

    fn failing_on(needle: &'static str) -> MockRunner {
        MockRunner::with_responder(move |command| {
            if command.to_string() == needle {
                Err(exit_error("mv"))
            } else {
                Ok(String::new())
            }
        })
    }

    #[test]
    fn should_plan_four_steps_in_order() {
        let saga = plan(&settings(), Path::new("/tmp/stage"), Path::new("/Applications"));
        let names: Vec<&str> = saga.steps().iter().map(SagaStep::name).collect();
        assert_eq!(
            names,
            vec![
                "remove stale backup",
                "back up current install",
                "move update into place",
                "remove backup"
            ]
        );
    }

    #[tokio::test]
    async fn should_run_every_step_on_success() {
        let runner = MockRunner::new();
        let saga = plan(&settings(), Path::new("/tmp/stage"), Path::new("/Applications"));

        assert_eq!(saga.run(&runner, TIMEOUT).await, Status::Success);
        assert_eq!(
            runner.history(),
            vec![
                "/bin/rm -rf /Applications/appFirewall.app.bak",
                "/bin/mv /Applications/appFirewall.app /Applications/appFirewall.app.bak",
                "/bin/mv /tmp/stage/appFirewall.app /Applications/appFirewall.app",
                "/bin/rm -rf /Applications/appFirewall.app.bak",
            ]
        );
    }

    #[tokio::test]
    async fn should_stop_when_stale_backup_cannot_be_removed() {
        let runner = failing_on("/bin/rm -rf /Applications/appFirewall.app.bak");
        let saga = plan(&settings(), Path::new("/tmp/stage"), Path::new("/Applications"));

        assert_eq!(saga.run(&runner, TIMEOUT).await, Status::Failed);
        assert_eq!(runner.history().len(), 1);
    }

    #[tokio::test]
    async fn should_report_backup_failure_without_rollback() {
        let runner =
            failing_on("/bin/mv /Applications/appFirewall.app /Applications/appFirewall.app.bak");
        let saga = plan(&settings(), Path::new("/tmp/stage"), Path::new("/Applications"));

        assert_eq!(saga.run(&runner, TIMEOUT).await, Status::BackupFailed);
        assert_eq!(runner.history().len(), 2);
    }

    #[tokio::test]
    async fn should_restore_backup_when_install_move_fails() {
        let runner = failing_on("/bin/mv /tmp/stage/appFirewall.app /Applications/appFirewall.app");
        let saga = plan(&settings(), Path::new("/tmp/stage"), Path::new("/Applications"));

        assert_eq!(saga.run(&runner, TIMEOUT).await, Status::InstallFailed);
        let history = runner.history();
        assert_eq!(history.len(), 4);
        assert_eq!(
            history[3],
            "/bin/mv /Applications/appFirewall.app.bak /Applications/appFirewall.app"
        );
    }

    #[tokio::test]
    async fn should_report_failed_rollback() {
        let runner = MockRunner::with_responder(|command| {
            let line = command.to_string();
            if line.starts_with("/bin/mv /tmp/stage")
                || line.starts_with("/bin/mv /Applications/appFirewall.app.bak")
            {
                Err(exit_error("mv"))
            } else {
                Ok(String::new())
            }
        });
        let saga = plan(&settings(), Path::new("/tmp/stage"), Path::new("/Applications"));

        assert_eq!(saga.run(&runner, TIMEOUT).await, Status::RollbackFailed);
    }

    #[tokio::test]
    async fn should_ignore_failure_of_best_effort_step() {
        let saga = Saga::new(Status::RollbackFailed)
            .step(SagaStep::new("first", PrivilegedCommand::new("/bin/true"), Status::Failed))
            .step(SagaStep::best_effort("cleanup", PrivilegedCommand::new("/bin/false")));
        let runner = MockRunner::with_responder(|command| {
            if command.program() == Path::new("/bin/false") {
                Err(exit_error("false"))
            } else {
                Ok(String::new())
            }
        });

        assert_eq!(saga.run(&runner, TIMEOUT).await, Status::Success);
        assert_eq!(runner.history().len(), 2);
    }

    #[tokio::test]
    async fn should_install_and_roll_back_on_real_filesystem() {
        let root = TempDir::new().unwrap();
        let staged = root.path().join("stage");
        let install = root.path().join("install");
        fs::create_dir_all(install.join("appFirewall.app")).unwrap();
        fs::write(install.join("appFirewall.app/version"), "1").unwrap();
        fs::create_dir_all(&staged).unwrap();

        let settings = InstallSettings {
            rm: "rm".into(),
            mv: "mv".into(),
            ..InstallSettings::default()
        };

        // Nothing staged yet: the move into place fails and the old install comes back.
        let status = plan(&settings, &staged, &install).run(&SystemRunner, TIMEOUT).await;
        assert_eq!(status, Status::InstallFailed);
        assert_eq!(fs::read_to_string(install.join("appFirewall.app/version")).unwrap(), "1");

        fs::create_dir_all(staged.join("appFirewall.app")).unwrap();
        fs::write(staged.join("appFirewall.app/version"), "2").unwrap();

        let status = plan(&settings, &staged, &install).run(&SystemRunner, TIMEOUT).await;
        assert_eq!(status, Status::Success);
        assert_eq!(fs::read_to_string(install.join("appFirewall.app/version")).unwrap(), "2");
        assert!(!install.join("appFirewall.app.bak").exists());
    }
}
