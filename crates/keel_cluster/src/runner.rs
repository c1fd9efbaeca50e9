//! Runs a sequencer agent on its own named thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;

use crate::sequencer::SequencerAgent;

type AgentOutcome = (Box<SequencerAgent>, anyhow::Result<()>);

/// Handle to a running agent thread.
///
/// The agent is handed back on join so callers can inspect its final state.
pub struct AgentRunner {
    interrupt: Arc<AtomicBool>,
    handle: Option<JoinHandle<AgentOutcome>>,
}

impl AgentRunner {
    /// Start the agent: `on_start`, then the duty cycle until the agent
    /// closes, fails, or is interrupted.
    pub fn spawn(name: &str, agent: SequencerAgent) -> anyhow::Result<Self> {
        let interrupt = agent.interrupt_handle();
        let idle_strategy = agent.idle_strategy_handle();
        let thread_interrupt = Arc::clone(&interrupt);
        let mut agent = Box::new(agent);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result: anyhow::Result<()> = (|| {
                    agent.on_start()?;
                    loop {
                        if thread_interrupt.load(Ordering::Acquire) {
                            break;
                        }
                        let work_count = agent.do_work()?;
                        if agent.is_closed() {
                            break;
                        }
                        idle_strategy.idle(work_count);
                    }
                    Ok(())
                })();
                if let Err(err) = &result {
                    tracing::error!(error = ?err, "sequencer agent terminated");
                }
                agent.on_close();
                (agent, result)
            })
            .context("spawn sequencer agent thread")?;

        Ok(Self {
            interrupt,
            handle: Some(handle),
        })
    }

    /// Request the agent to stop at its next idle point.
    pub fn stop(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Stop and wait for the agent, returning its terminal result.
    pub fn join(self) -> anyhow::Result<()> {
        self.join_agent().map(|_| ())
    }

    /// Stop and wait for the agent, returning it for inspection.
    pub fn join_agent(mut self) -> anyhow::Result<Box<SequencerAgent>> {
        self.stop();
        let Some(handle) = self.handle.take() else {
            anyhow::bail!("sequencer agent already joined");
        };
        let (agent, result) = handle
            .join()
            .map_err(|_| anyhow::anyhow!("sequencer agent thread panicked"))?;
        result?;
        Ok(agent)
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
