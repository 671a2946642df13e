//! 执行调度器
//!
//! 在独立线程中运行 [`Engine`]，与交互上下文之间只通过两个通道通信：
//! - 命令通道（暂停 / 恢复 / 取消），在测试边界读取
//! - 事件通道（[`SchedulerEvent`]），由调用方按需消费
//!
//! 当前测试总是执行完毕后才处理暂停；取消同样在边界生效，
//! 若配置为步骤边界取消，执行中的测试会在下一个步骤处结束并执行清理。

use crate::context::CancelToken;
use crate::engine::{Engine, EngineState, Step};
use crate::error::EngineError;
use crate::result::{SequenceReport, TestResult};
use crate::spec::TestSequence;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// 发给调度线程的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    Pause,
    Resume,
    Cancel,
}

/// 调度线程发出的生命周期事件
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    SequenceStarted { name: String, count: usize },
    TestStarted { index: usize, name: String },
    TestFinished(TestResult),
    SequencePaused { reason: String },
    SequenceResumed,
    SequenceCancelled(SequenceReport),
    SequenceFinished(SequenceReport),
}

impl SchedulerEvent {
    /// 是否为最后一个事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::SequenceCancelled(_) | SchedulerEvent::SequenceFinished(_)
        )
    }
}

/// 执行调度器句柄
pub struct Scheduler {
    commands: Sender<SchedulerCommand>,
    events: Receiver<SchedulerEvent>,
    cancel: CancelToken,
    handle: Option<JoinHandle<Engine>>,
}

impl Scheduler {
    /// 在新线程中开始执行序列
    ///
    /// 序列级问题（重名测试、引擎正忙）在启动前返回错误。
    pub fn spawn(engine: Engine, sequence: TestSequence) -> Result<Self, EngineError> {
        sequence.check_unique_names()?;
        let state = engine.state();
        if !(state == EngineState::Idle || state.is_terminal()) {
            return Err(EngineError::InvalidState {
                state,
                action: "spawn scheduler",
            });
        }

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let cancel = engine.cancel_token();

        let handle = std::thread::Builder::new()
            .name("eol-scheduler".into())
            .spawn(move || run_sequence(engine, sequence, command_rx, event_tx))
            .map_err(|e| EngineError::Thread(e.to_string()))?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            cancel,
            handle: Some(handle),
        })
    }

    /// 请求在下一个测试边界暂停
    pub fn pause(&self) -> bool {
        self.send(SchedulerCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(SchedulerCommand::Resume)
    }

    /// 请求取消
    pub fn cancel(&self) -> bool {
        self.cancel.cancel();
        self.send(SchedulerCommand::Cancel)
    }

    /// 事件接收端
    pub fn events(&self) -> &Receiver<SchedulerEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// 等待调度线程结束并取回引擎
    pub fn join(mut self) -> Result<Engine, EngineError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| EngineError::Thread("scheduler thread panicked".into())),
            None => Err(EngineError::Thread("scheduler already joined".into())),
        }
    }

    fn send(&self, command: SchedulerCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // 未 join 就丢弃：取消并等待当前测试的清理完成
            self.cancel.cancel();
            let _ = self.commands.send(SchedulerCommand::Cancel);
            if handle.join().is_err() {
                warn!("Scheduler thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("finished", &self.is_finished())
            .field("pending_events", &self.events.len())
            .finish()
    }
}

fn run_sequence(
    mut engine: Engine,
    sequence: TestSequence,
    commands: Receiver<SchedulerCommand>,
    events: Sender<SchedulerEvent>,
) -> Engine {
    let emit = |event: SchedulerEvent| {
        debug!("Scheduler event: {:?}", event);
        // 接收端已丢弃时继续执行，结果仍可通过 join 取回
        let _ = events.send(event);
    };

    let name = sequence.name.clone();
    let count = sequence.len();
    if let Err(e) = engine.begin(sequence) {
        error!("Failed to start sequence '{}': {}", name, e);
        emit(SchedulerEvent::SequenceFinished(engine.report()));
        return engine;
    }
    emit(SchedulerEvent::SequenceStarted { name, count });
    let poll_interval = engine.bus().config().poll_interval();
    let cancel = engine.cancel_token();

    loop {
        // 测试边界：先处理所有待处理命令
        for command in commands.try_iter() {
            apply(&mut engine, command, &emit);
        }
        if cancel.is_cancelled() && !engine.state().is_terminal() {
            let _ = engine.cancel();
        }

        match engine.state() {
            EngineState::Running => {},
            EngineState::Paused => {
                match commands.recv_timeout(poll_interval) {
                    Ok(command) => apply(&mut engine, command, &emit),
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = engine.idle_poll() {
                            warn!("Poll while paused failed: {}", e);
                        }
                    },
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("Scheduler handle dropped while paused, cancelling");
                        let _ = engine.cancel();
                    },
                }
                continue;
            },
            _ => break,
        }

        // 边界检查之后仍可能收到取消，由 step_with 决定测试是否真正开始
        let started = |index: usize, name: &str| {
            emit(SchedulerEvent::TestStarted {
                index,
                name: name.to_string(),
            })
        };
        match engine.step_with(started) {
            Ok(Step::Finished(result)) => emit(SchedulerEvent::TestFinished(result)),
            Ok(Step::Paused(result)) => {
                let reason = engine.pause_reason().unwrap_or_default().to_string();
                emit(SchedulerEvent::TestFinished(result));
                emit(SchedulerEvent::SequencePaused { reason });
            },
            Ok(Step::Done(_)) => {},
            Err(e) => {
                error!("Scheduler step failed: {}", e);
                break;
            },
        }
    }

    let report = engine.report();
    match engine.state() {
        EngineState::Cancelled => {
            info!("Sequence '{}' cancelled", report.name);
            emit(SchedulerEvent::SequenceCancelled(report));
        },
        _ => emit(SchedulerEvent::SequenceFinished(report)),
    }
    engine
}

fn apply(engine: &mut Engine, command: SchedulerCommand, emit: &impl Fn(SchedulerEvent)) {
    match command {
        SchedulerCommand::Pause => {
            if engine.pause("pause requested").is_ok() {
                emit(SchedulerEvent::SequencePaused {
                    reason: "pause requested".into(),
                });
            }
        },
        SchedulerCommand::Resume => {
            if engine.resume().is_ok() {
                emit(SchedulerEvent::SequenceResumed);
            }
        },
        SchedulerCommand::Cancel => {
            if let Err(e) = engine.cancel() {
                debug!("Cancel ignored: {}", e);
            }
        },
    }
}
