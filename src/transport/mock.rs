//! Scripted in-memory transport for tests.

use super::{CommandOutput, Session, Transport, TransportError};
use crate::registry::HostDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Output {
        stdout: String,
        stderr: String,
        exit_code: i32,
        delay: Duration,
    },
    Lost(String),
    Hang,
    Panic,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Output {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn failed(stderr: &str, exit_code: i32) -> Self {
        Reply::Output {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
            delay: Duration::ZERO,
        }
    }

    pub fn after(self, wait: Duration) -> Self {
        match self {
            Reply::Output {
                stdout,
                stderr,
                exit_code,
                ..
            } => Reply::Output {
                stdout,
                stderr,
                exit_code,
                delay: wait,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HostScript {
    Refuse {
        after: Duration,
        auth: bool,
    },
    Accept {
        connect_delay: Duration,
        default_reply: Reply,
        replies: HashMap<String, Reply>,
    },
}

impl HostScript {
    /// Every command succeeds after `command_delay`.
    pub fn healthy(command_delay: Duration) -> Self {
        HostScript::Accept {
            connect_delay: Duration::ZERO,
            default_reply: Reply::ok("ok\n").after(command_delay),
            replies: HashMap::new(),
        }
    }

    pub fn unreachable(after: Duration) -> Self {
        HostScript::Refuse { after, auth: false }
    }

    pub fn auth_failure() -> Self {
        HostScript::Refuse {
            after: Duration::ZERO,
            auth: true,
        }
    }

    pub fn connect_after(mut self, wait: Duration) -> Self {
        if let HostScript::Accept { connect_delay, .. } = &mut self {
            *connect_delay = wait;
        }
        self
    }

    pub fn reply(mut self, command: &str, reply: Reply) -> Self {
        if let HostScript::Accept { replies, .. } = &mut self {
            replies.insert(command.to_string(), reply);
        }
        self
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    hosts: HashMap<String, HostScript>,
    open_sessions: Arc<AtomicUsize>,
    executed: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, name: &str, script: HostScript) -> Self {
        self.hosts.insert(name.to_string(), script);
        self
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn executed_on(&self, host: &str) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        host: &HostDescriptor,
        _timeout: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        let script = self
            .hosts
            .get(&host.name)
            .cloned()
            .unwrap_or(HostScript::unreachable(Duration::ZERO));
        match script {
            HostScript::Refuse { after, auth } => {
                tokio::time::sleep(after).await;
                if auth {
                    Err(TransportError::Auth("Permission denied (publickey)".to_string()))
                } else {
                    Err(TransportError::Unreachable(format!(
                        "connect to host {} port {}: Connection refused",
                        host.address, host.port
                    )))
                }
            }
            HostScript::Accept {
                connect_delay,
                default_reply,
                replies,
            } => {
                tokio::time::sleep(connect_delay).await;
                self.open_sessions.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedSession {
                    host: host.name.clone(),
                    default_reply,
                    replies,
                    open_sessions: self.open_sessions.clone(),
                    executed: self.executed.clone(),
                }))
            }
        }
    }
}

struct ScriptedSession {
    host: String,
    default_reply: Reply,
    replies: HashMap<String, Reply>,
    open_sessions: Arc<AtomicUsize>,
    executed: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn exec(
        &mut self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        self.executed
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));
        let reply = self
            .replies
            .get(command)
            .cloned()
            .unwrap_or_else(|| self.default_reply.clone());
        match reply {
            Reply::Output {
                stdout,
                stderr,
                exit_code,
                delay,
            } => {
                tokio::time::sleep(delay).await;
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code: Some(exit_code),
                })
            }
            Reply::Lost(msg) => Err(TransportError::SessionLost(msg)),
            Reply::Hang => std::future::pending().await,
            Reply::Panic => panic!("scripted fault on {}", self.host),
        }
    }

    async fn close(self: Box<Self>) {}
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
