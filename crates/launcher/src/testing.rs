//! Scripted executor for unit tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::artifact::{ArtifactResolver, ResolvedArtifact};
use crate::error::{LaunchError, Result};
use crate::exec::{BackgroundProcess, CommandOutput, Exit, InputSource, ProcessExecutor};

#[derive(Clone)]
enum Reply {
    Output { code: i32, stdout: String },
    SpawnFailure,
    Exited(i32),
    Relay(SocketAddr),
    OccupyThenExit { code: i32, after: Duration },
}

#[derive(Clone, Debug)]
pub(crate) struct Call {
    pub(crate) command: String,
    pub(crate) background: bool,
}

/// Records every command and answers from rules matched by substring, first
/// match wins. Unmatched foreground commands succeed silently; unmatched
/// background commands stay alive until terminated. A relay rule fakes
/// `ssh -L`: it listens on the forwarded local port and pipes connections
/// to the given address.
#[derive(Default)]
pub(crate) struct FakeExecutor {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    rules: Vec<(String, Reply)>,
    calls: Vec<Call>,
}

impl FakeExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(&self, pattern: &str, code: i32, stdout: &str) {
        self.push(
            pattern,
            Reply::Output {
                code,
                stdout: stdout.to_string(),
            },
        );
    }

    pub(crate) fn fail_spawn(&self, pattern: &str) {
        self.push(pattern, Reply::SpawnFailure);
    }

    pub(crate) fn exit_on_spawn(&self, pattern: &str, code: i32) {
        self.push(pattern, Reply::Exited(code));
    }

    pub(crate) fn relay(&self, pattern: &str, to: SocketAddr) {
        self.push(pattern, Reply::Relay(to));
    }

    /// Fakes a forward whose local port is already taken: a foreign
    /// listener answers on the `-L` port and the process exits with `code`
    /// after `after`.
    pub(crate) fn occupy_then_exit(&self, pattern: &str, code: i32, after: Duration) {
        self.push(pattern, Reply::OccupyThenExit { code, after });
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.command).collect()
    }

    fn push(&self, pattern: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .rules
            .push((pattern.to_string(), reply));
    }

    fn lookup(&self, command: &str, background: bool) -> Option<Reply> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            command: command.to_string(),
            background,
        });
        state
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
    }
}

fn spawn_failure(command: &str) -> LaunchError {
    LaunchError::Spawn {
        command: command.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
    }
}

#[async_trait]
impl ProcessExecutor for FakeExecutor {
    async fn run(
        &self,
        command: &str,
        _input: &InputSource,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        match self.lookup(command, false) {
            Some(Reply::SpawnFailure) => Err(spawn_failure(command)),
            Some(Reply::Output { code, stdout }) => Ok(CommandOutput {
                exit: Exit { code: Some(code) },
                stdout,
                stderr: String::new(),
            }),
            _ => Ok(CommandOutput {
                exit: Exit { code: Some(0) },
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }

    async fn spawn(&self, command: &str, _input: &InputSource) -> Result<Box<dyn BackgroundProcess>> {
        match self.lookup(command, true) {
            Some(Reply::SpawnFailure) => Err(spawn_failure(command)),
            Some(Reply::Exited(code)) => Ok(Box::new(FakeProcess {
                task: None,
                finished_code: code,
                exit: Some(Exit { code: Some(code) }),
            })),
            Some(Reply::OccupyThenExit { code, after }) => {
                let (local_port, _, _) = forward_spec(command).expect("rule needs -L");
                let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
                tokio::spawn(async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        drop(stream);
                    }
                });
                Ok(Box::new(FakeProcess {
                    task: Some(tokio::spawn(tokio::time::sleep(after))),
                    finished_code: code,
                    exit: None,
                }))
            }
            Some(Reply::Relay(to)) => {
                let (local_port, _, _) = forward_spec(command).expect("relay rule needs -L");
                let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
                Ok(Box::new(FakeProcess {
                    task: Some(tokio::spawn(relay(listener, to))),
                    finished_code: 0,
                    exit: None,
                }))
            }
            _ => Ok(Box::new(FakeProcess {
                task: None,
                finished_code: 0,
                exit: None,
            })),
        }
    }
}

/// `(local_port, forward_host, remote_port)` of the `-L` argument.
pub(crate) fn forward_spec(command: &str) -> Option<(u16, String, u16)> {
    let mut words = command.split_whitespace();
    words.find(|word| *word == "-L")?;
    let spec = words.next()?;
    let mut parts = spec.split(':');
    let local = parts.next()?.parse().ok()?;
    let host = parts.next()?.to_string();
    let remote = parts.next()?.parse().ok()?;
    Some((local, host, remote))
}

async fn relay(listener: TcpListener, to: SocketAddr) {
    while let Ok((mut inbound, _)) = listener.accept().await {
        tokio::spawn(async move {
            if let Ok(mut outbound) = TcpStream::connect(to).await {
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            }
        });
    }
}

struct FakeProcess {
    task: Option<JoinHandle<()>>,
    /// Exit code reported once `task` finishes on its own.
    finished_code: i32,
    exit: Option<Exit>,
}

#[async_trait]
impl BackgroundProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> Result<Option<Exit>> {
        if self.exit.is_none() {
            if let Some(task) = self.task.as_ref() {
                if task.is_finished() {
                    self.exit = Some(Exit {
                        code: Some(self.finished_code),
                    });
                }
            }
        }
        Ok(self.exit)
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if self.exit.is_none() {
            self.exit = Some(Exit { code: None });
        }
        Ok(())
    }

    fn start_kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Resolves every helper to `/opt/helpers/<name>`.
pub(crate) struct FixedResolver;

impl ArtifactResolver for FixedResolver {
    fn resolve(&self, name: &str) -> Result<ResolvedArtifact> {
        Ok(ResolvedArtifact {
            path: PathBuf::from(format!("/opt/helpers/{name}")),
            separator: '/',
        })
    }
}

/// A loopback TCP echo server standing in for a remote service.
pub(crate) async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(read) = stream.read(&mut buf).await {
                    if read == 0 || stream.write_all(&buf[..read]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}
