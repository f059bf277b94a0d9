//! Runs the configured test procedure when the station starts a test.

use std::{collections::BTreeMap, process::Stdio, time::Duration};

use ota_core::{MAX_PAYLOAD_LEN, Report, TestConfig, TestState};
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    process::{Child, Command},
    select,
    sync::broadcast::{self, error::RecvError},
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{SessionEvent, UnitHandle};

/// Room left for the body of an `UPD`.
const MAX_UPDATE_LEN: usize = MAX_PAYLOAD_LEN - "UPD:".len();

/// Starts a child process per test and reports its outcome through the unit.
///
/// The command line for the test's configuration id is run with
/// `--role <role>` appended. Its stdout becomes `UPD` progress, batched to at
/// most one message per `update_interval`. Exit status 0 completes the test,
/// anything else fails it. The child is killed if the test stops running
/// first.
pub struct ProcedureRunner {
    unit: UnitHandle,
    events: broadcast::Receiver<SessionEvent>,
    procedures: BTreeMap<u32, String>,
    update_interval: Duration,
}

impl ProcedureRunner {
    /// Subscribes right away, create it before the unit runs.
    #[must_use]
    pub fn new(
        unit: UnitHandle,
        procedures: BTreeMap<u32, String>,
        update_interval: Duration,
    ) -> Self {
        Self {
            events: unit.subscribe(),
            unit,
            procedures,
            update_interval,
        }
    }

    /// Runs until the unit stops.
    ///
    /// # Errors
    ///
    /// If a running child cannot be killed.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let event = select! {
                () = self.unit.stopped() => return Ok(()),
                event = self.events.recv() => event,
            };
            match event {
                Ok(SessionEvent::Report {
                    report: Report::Started(config),
                    ..
                }) => self.execute(config).await?,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("runner missed {skipped} events"),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn execute(&mut self, config: TestConfig) -> anyhow::Result<()> {
        let Some(command) = self.procedures.get(&config.configuration_id) else {
            self.unit
                .fail_test(format!(
                    "no procedure for configuration id {}",
                    config.configuration_id
                ))
                .await;
            return Ok(());
        };
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            self.unit.fail_test("empty procedure command").await;
            return Ok(());
        };

        info!(%config, "starting procedure `{command}`");
        let child = Command::new(program)
            .args(parts)
            .arg("--role")
            .arg(config.role.to_string())
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                self.unit
                    .fail_test(format!("cannot start procedure: {e}"))
                    .await;
                return Ok(());
            }
        };

        self.supervise(child).await
    }

    async fn supervise(&mut self, mut child: Child) -> anyhow::Result<()> {
        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut pending: Vec<String> = Vec::new();
        let mut flush = interval(self.update_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                line = async { stdout.as_mut()?.next_line().await.ok().flatten() }, if stdout.is_some() => {
                    match line {
                        Some(line) => pending.push(line),
                        None => stdout = None,
                    }
                }
                _ = flush.tick() => self.send_progress(&mut pending).await,
                status = child.wait() => {
                    if let Some(lines) = stdout.as_mut() {
                        while let Ok(Some(line)) = lines.next_line().await {
                            pending.push(line);
                        }
                    }
                    self.send_progress(&mut pending).await;
                    match status {
                        Ok(status) if status.success() => self.unit.complete_test().await,
                        Ok(status) => {
                            let code = status
                                .code()
                                .map_or_else(|| "killed".to_string(), |code| code.to_string());
                            self.unit.fail_test(format!("exit status {code}")).await;
                        }
                        Err(e) => self.unit.fail_test(format!("procedure lost: {e}")).await,
                    }
                    return Ok(());
                }
                () = self.unit.stopped() => {
                    child.kill().await?;
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    Ok(SessionEvent::TestStateChanged { state, .. }) if state != Some(TestState::Running) => {
                        info!("test no longer running, stopping procedure");
                        child.kill().await?;
                        return Ok(());
                    }
                    Err(RecvError::Closed) => {
                        child.kill().await?;
                        return Ok(());
                    }
                    _ => {}
                },
            }
        }
    }

    async fn send_progress(&self, pending: &mut Vec<String>) {
        if pending.is_empty() {
            return;
        }
        let payload = truncate(pending.join(" "), MAX_UPDATE_LEN);
        pending.clear();
        debug!("progress: {payload}");
        self.unit.report_progress(payload).await;
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
