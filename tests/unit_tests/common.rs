// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory doubles for the services of a Test Agent.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fs,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use hex::FromHex;
use tokio::sync::Semaphore;
use iscsi_tapi::{
    agent::{
        AgentSession,
        conf::ConfTree,
        rpc::{AgentRpc, OpenFlags, RemotePtr, RpcArg, RpcReply, RpcServer, TaRpc},
        transport::{CsapHandle, RecvTimeout, Transport},
    },
    asn::AsnValue,
    cfg::config::{Config, resolve_config_path},
    error::{TapiError, TapiResult},
};

pub const TA: &str = "Agt_A";

pub fn load_config() -> Result<Config> {
    resolve_config_path("tests/config.yaml").and_then(Config::load_from_file)
}

pub fn session() -> AgentSession {
    AgentSession::new(TA, 0)
}

/// Loads a hex fixture, whitespace ignored.
pub fn load_fixture(path: &str) -> Result<Vec<u8>> {
    let s = fs::read_to_string(path)?;
    let cleaned = s.trim().replace(|c: char| c.is_whitespace(), "");
    Ok(Vec::from_hex(&cleaned)?)
}

// ---------------------------------------------------------------------------
// Configuration tree
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemConf {
    pub tree: Mutex<BTreeMap<String, String>>,
}

impl MemConf {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        let conf = Self::default();
        {
            let mut tree = conf.tree.lock().unwrap();
            for (k, v) in entries {
                tree.insert((*k).to_string(), (*v).to_string());
            }
        }
        conf
    }

    pub fn value(&self, path: &str) -> Option<String> {
        self.tree.lock().unwrap().get(path).cloned()
    }
}

impl ConfTree for MemConf {
    async fn cfg_set(&self, path: &str, value: &str) -> TapiResult<()> {
        self.tree
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn cfg_get(&self, path: &str) -> TapiResult<String> {
        self.value(path)
            .ok_or_else(|| TapiError::NotFound(path.to_string()))
    }

    async fn cfg_add(&self, path: &str, value: &str) -> TapiResult<()> {
        let mut tree = self.tree.lock().unwrap();
        if tree.contains_key(path) {
            return Err(TapiError::InvalidArgument(format!("{path} already exists")));
        }
        tree.insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn cfg_del(&self, path: &str) -> TapiResult<()> {
        let mut tree = self.tree.lock().unwrap();
        if tree.remove(path).is_none() {
            return Err(TapiError::NotFound(path.to_string()));
        }
        let below = format!("{path}/");
        tree.retain(|k, _| !k.starts_with(&below));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generic RPC
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemRpc {
    pub calls: Mutex<Vec<(String, Vec<RpcArg>)>>,
    pub replies: Mutex<HashMap<String, RpcReply>>,
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemRpc {
    pub fn reply(&self, function: &str, reply: RpcReply) {
        self.replies
            .lock()
            .unwrap()
            .insert(function.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<(String, Vec<RpcArg>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl TaRpc for MemRpc {
    async fn call(
        &self,
        _session: &AgentSession,
        function: &str,
        args: &[RpcArg],
    ) -> TapiResult<RpcReply> {
        self.calls
            .lock()
            .unwrap()
            .push((function.to_string(), args.to_vec()));
        Ok(self
            .replies
            .lock()
            .unwrap()
            .get(function)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_file(&self, ta: &str, contents: &[u8], remote_path: &str) -> TapiResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(format!("{ta}:{remote_path}"), contents.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dedicated RPC server backed by an in-memory file system
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct OpenFile {
    path: String,
    pos: usize,
}

#[derive(Debug, Default)]
pub struct AgentState {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    fds: Mutex<HashMap<i32, OpenFile>>,
    bufs: Mutex<HashMap<u64, Vec<u8>>>,
    next: Mutex<(i32, u64)>,
    pub opened: Mutex<Vec<(String, OpenFlags)>>,
    pub shell: Mutex<Vec<String>>,
    pub failing_shell: Mutex<HashSet<String>>,
    pub created: Mutex<Vec<String>>,
    pub destroyed: Mutex<Vec<String>>,
    /// Caps the size of every write, to provoke short writes.
    pub write_limit: Mutex<Option<usize>>,
    /// Shell commands that block until their gate gets a permit.
    pub gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl AgentState {
    pub fn put(&self, path: &str, data: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn live_buffers(&self) -> usize {
        self.bufs.lock().unwrap().len()
    }

    pub fn open_fds(&self) -> usize {
        self.fds.lock().unwrap().len()
    }

    /// Makes `cmd` hang until a permit is added to the returned gate.
    pub fn gate(&self, cmd: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(cmd.to_string(), Arc::clone(&gate));
        gate
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemAgent {
    pub state: Arc<AgentState>,
}

#[derive(Debug)]
pub struct MemServer {
    name: String,
    state: Arc<AgentState>,
}

impl AgentRpc for MemAgent {
    type Server = MemServer;

    async fn create_server(&self, ta: &str, name: &str) -> TapiResult<MemServer> {
        self.state
            .created
            .lock()
            .unwrap()
            .push(format!("{ta}/{name}"));
        Ok(MemServer {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    async fn destroy_server(&self, server: MemServer) -> TapiResult<()> {
        self.state.destroyed.lock().unwrap().push(server.name);
        Ok(())
    }
}

impl RpcServer for MemServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, path: &str, flags: OpenFlags, _mode: u32) -> TapiResult<i32> {
        self.state
            .opened
            .lock()
            .unwrap()
            .push((path.to_string(), flags));
        {
            let mut files = self.state.files.lock().unwrap();
            match files.get_mut(path) {
                Some(data) if flags.contains(OpenFlags::TRUNC) => data.clear(),
                Some(_) => {},
                None if flags.contains(OpenFlags::CREAT) => {
                    files.insert(path.to_string(), Vec::new());
                },
                None => return Err(TapiError::NotFound(format!("open({path})"))),
            }
        }
        let fd = {
            let mut next = self.state.next.lock().unwrap();
            next.0 += 1;
            next.0 + 2
        };
        self.state.fds.lock().unwrap().insert(
            fd,
            OpenFile {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(fd)
    }

    async fn close(&self, fd: i32) -> TapiResult<()> {
        match self.state.fds.lock().unwrap().remove(&fd) {
            Some(_) => Ok(()),
            None => Err(TapiError::BadFile(format!("close({fd})"))),
        }
    }

    async fn lseek(&self, fd: i32, offset: u64) -> TapiResult<u64> {
        let mut fds = self.state.fds.lock().unwrap();
        let f = fds
            .get_mut(&fd)
            .ok_or_else(|| TapiError::BadFile(format!("lseek({fd})")))?;
        f.pos = offset as usize;
        Ok(offset)
    }

    async fn read(&self, fd: i32, buf: RemotePtr, len: usize) -> TapiResult<usize> {
        let mut fds = self.state.fds.lock().unwrap();
        let f = fds
            .get_mut(&fd)
            .ok_or_else(|| TapiError::BadFile(format!("read({fd})")))?;
        let files = self.state.files.lock().unwrap();
        let data = files.get(&f.path).map(Vec::as_slice).unwrap_or_default();
        let start = f.pos.min(data.len());
        let n = len.min(data.len() - start);

        let mut bufs = self.state.bufs.lock().unwrap();
        let dst = bufs
            .get_mut(&buf.0)
            .ok_or_else(|| TapiError::WrongPointer(format!("buffer {:#x}", buf.0)))?;
        if dst.len() < n {
            return Err(TapiError::NoBuffers {
                needed: n,
                available: dst.len(),
            });
        }
        dst[..n].copy_from_slice(&data[start..start + n]);
        f.pos = start + n;
        Ok(n)
    }

    async fn write(&self, fd: i32, buf: RemotePtr, len: usize) -> TapiResult<usize> {
        let mut fds = self.state.fds.lock().unwrap();
        let f = fds
            .get_mut(&fd)
            .ok_or_else(|| TapiError::BadFile(format!("write({fd})")))?;
        let bufs = self.state.bufs.lock().unwrap();
        let src = bufs
            .get(&buf.0)
            .ok_or_else(|| TapiError::WrongPointer(format!("buffer {:#x}", buf.0)))?;
        let n = match *self.state.write_limit.lock().unwrap() {
            Some(limit) => len.min(limit),
            None => len,
        };

        let mut files = self.state.files.lock().unwrap();
        let data = files.entry(f.path.clone()).or_default();
        if data.len() < f.pos + n {
            data.resize(f.pos + n, 0);
        }
        data[f.pos..f.pos + n].copy_from_slice(&src[..n]);
        f.pos += n;
        Ok(n)
    }

    async fn memalign(&self, align: usize, size: usize) -> TapiResult<RemotePtr> {
        assert!(align.is_power_of_two());
        let ptr = {
            let mut next = self.state.next.lock().unwrap();
            next.1 += 1;
            next.1 * 0x10_0000
        };
        self.state.bufs.lock().unwrap().insert(ptr, vec![0; size]);
        Ok(RemotePtr(ptr))
    }

    async fn free(&self, ptr: RemotePtr) -> TapiResult<()> {
        match self.state.bufs.lock().unwrap().remove(&ptr.0) {
            Some(_) => Ok(()),
            None => Err(TapiError::WrongPointer(format!("free({:#x})", ptr.0))),
        }
    }

    async fn set_buf(&self, data: &[u8], ptr: RemotePtr) -> TapiResult<()> {
        let mut bufs = self.state.bufs.lock().unwrap();
        let dst = bufs
            .get_mut(&ptr.0)
            .ok_or_else(|| TapiError::WrongPointer(format!("buffer {:#x}", ptr.0)))?;
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn get_buf(&self, ptr: RemotePtr, len: usize) -> TapiResult<Vec<u8>> {
        let bufs = self.state.bufs.lock().unwrap();
        let src = bufs
            .get(&ptr.0)
            .ok_or_else(|| TapiError::WrongPointer(format!("buffer {:#x}", ptr.0)))?;
        Ok(src[..len].to_vec())
    }

    async fn system(&self, cmd: &str) -> TapiResult<i32> {
        let gate = self.state.gates.lock().unwrap().get(cmd).cloned();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| TapiError::Failed(e.to_string()))?
                .forget();
        }
        self.state.shell.lock().unwrap().push(cmd.to_string());
        if self.state.failing_shell.lock().unwrap().contains(cmd) {
            return Ok(1);
        }
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Loopback CSAP transport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Armed {
    forward: Option<u32>,
    limit: u32,
    timeout: Option<u32>,
}

#[derive(Debug, Default)]
pub struct MockCsap {
    pub stack: String,
    pub spec: AsnValue,
    /// Packets that arrived from the wire and wait for a receive.
    pub inbox: VecDeque<AsnValue>,
    /// Everything sent or forwarded through this CSAP.
    pub sent: Vec<AsnValue>,
    /// CSAP whose inbox receives what this one sends.
    pub peer: Option<u32>,
    pub patterns: Vec<AsnValue>,
    armed: Option<Armed>,
    matched: u32,
    stored: Vec<AsnValue>,
}

#[derive(Debug, Default)]
pub struct LoopTransport {
    pub csaps: Mutex<BTreeMap<u32, MockCsap>>,
    next: Mutex<u32>,
    pub accept_fd: Mutex<Option<i32>>,
}

impl LoopTransport {
    /// Whatever `a` sends arrives at `b` and vice versa.
    pub fn link(&self, a: CsapHandle, b: CsapHandle) {
        let mut csaps = self.csaps.lock().unwrap();
        if let Some(c) = csaps.get_mut(&a.0) {
            c.peer = Some(b.0);
        }
        if let Some(c) = csaps.get_mut(&b.0) {
            c.peer = Some(a.0);
        }
    }

    /// Puts a packet on the wire towards `csap`.
    pub fn inject(&self, csap: CsapHandle, pkt: AsnValue) {
        if let Some(c) = self.csaps.lock().unwrap().get_mut(&csap.0) {
            c.inbox.push_back(pkt);
        }
    }

    pub fn sent(&self, csap: CsapHandle) -> Vec<AsnValue> {
        self.csaps
            .lock()
            .unwrap()
            .get(&csap.0)
            .map(|c| c.sent.clone())
            .unwrap_or_default()
    }

    pub fn spec(&self, csap: CsapHandle) -> Option<(String, AsnValue)> {
        self.csaps
            .lock()
            .unwrap()
            .get(&csap.0)
            .map(|c| (c.stack.clone(), c.spec.clone()))
    }

    pub fn last_pattern(&self, csap: CsapHandle) -> Option<AsnValue> {
        self.csaps
            .lock()
            .unwrap()
            .get(&csap.0)
            .and_then(|c| c.patterns.last().cloned())
    }

    pub fn is_armed(&self, csap: CsapHandle) -> bool {
        self.csaps
            .lock()
            .unwrap()
            .get(&csap.0)
            .is_some_and(|c| c.armed.is_some())
    }

    pub fn count(&self) -> usize {
        self.csaps.lock().unwrap().len()
    }

    /// Moves inbox packets through every armed receive.
    fn pump(csaps: &mut BTreeMap<u32, MockCsap>) {
        let ids: Vec<u32> = csaps.keys().copied().collect();
        for id in ids {
            loop {
                let Some(c) = csaps.get_mut(&id) else { break };
                let Some(armed) = &c.armed else { break };
                if armed.limit != 0 && c.matched >= armed.limit {
                    break;
                }
                let forward = armed.forward;
                let Some(pkt) = c.inbox.pop_front() else { break };
                c.matched += 1;
                c.stored.push(pkt.clone());
                let Some(to) = forward else { continue };
                let peer = csaps.get_mut(&to).and_then(|t| {
                    t.sent.push(pkt.clone());
                    t.peer
                });
                if let Some(p) = peer.and_then(|p| csaps.get_mut(&p)) {
                    p.inbox.push_back(pkt);
                }
            }
        }
    }

    fn with_csap<R>(
        &self,
        csap: CsapHandle,
        f: impl FnOnce(&mut MockCsap) -> TapiResult<R>,
    ) -> TapiResult<R> {
        let mut csaps = self.csaps.lock().unwrap();
        Self::pump(&mut csaps);
        let c = csaps
            .get_mut(&csap.0)
            .ok_or_else(|| TapiError::NotFound(format!("CSAP {csap}")))?;
        f(c)
    }
}

fn forward_target(pattern: &AsnValue) -> Option<u32> {
    pattern
        .read_int("0.actions.0.#forw-pld.csap-id")
        .ok()
        .map(|v| v as u32)
}

impl Transport for LoopTransport {
    async fn csap_create(
        &self,
        _session: &AgentSession,
        stack: &str,
        spec: &AsnValue,
    ) -> TapiResult<CsapHandle> {
        let id = {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            *next
        };
        self.csaps.lock().unwrap().insert(
            id,
            MockCsap {
                stack: stack.to_string(),
                spec: spec.clone(),
                ..MockCsap::default()
            },
        );
        Ok(CsapHandle(id))
    }

    async fn csap_destroy(&self, _session: &AgentSession, csap: CsapHandle) -> TapiResult<()> {
        match self.csaps.lock().unwrap().remove(&csap.0) {
            Some(_) => Ok(()),
            None => Err(TapiError::NotFound(format!("CSAP {csap}"))),
        }
    }

    async fn send(
        &self,
        _session: &AgentSession,
        csap: CsapHandle,
        template: &AsnValue,
    ) -> TapiResult<()> {
        let mut csaps = self.csaps.lock().unwrap();
        let peer = {
            let c = csaps
                .get_mut(&csap.0)
                .ok_or_else(|| TapiError::NotFound(format!("CSAP {csap}")))?;
            c.sent.push(template.clone());
            c.peer
        };
        if let Some(p) = peer.and_then(|p| csaps.get_mut(&p)) {
            p.inbox.push_back(template.clone());
        }
        Ok(())
    }

    async fn recv_start(
        &self,
        _session: &AgentSession,
        csap: CsapHandle,
        pattern: &AsnValue,
        timeout: RecvTimeout,
        count: u32,
    ) -> TapiResult<()> {
        self.with_csap(csap, |c| {
            c.patterns.push(pattern.clone());
            c.matched = 0;
            c.stored.clear();
            c.armed = Some(Armed {
                forward: forward_target(pattern),
                limit: count,
                timeout: match timeout {
                    RecvTimeout::Ms(ms) => Some(ms),
                    RecvTimeout::Infinite => None,
                },
            });
            Ok(())
        })?;
        let mut csaps = self.csaps.lock().unwrap();
        Self::pump(&mut csaps);
        Ok(())
    }

    async fn recv_wait(
        &self,
        _session: &AgentSession,
        csap: CsapHandle,
    ) -> TapiResult<Vec<AsnValue>> {
        self.with_csap(csap, |c| {
            let armed = c
                .armed
                .take()
                .ok_or_else(|| TapiError::InvalidArgument("no receive armed".into()))?;
            if c.matched == 0 {
                return Err(TapiError::TimedOut(format!(
                    "nothing within {:?} ms",
                    armed.timeout
                )));
            }
            Ok(std::mem::take(&mut c.stored))
        })
    }

    async fn recv_get(&self, _session: &AgentSession, csap: CsapHandle) -> TapiResult<u32> {
        self.with_csap(csap, |c| Ok(c.matched))
    }

    async fn recv_stop(&self, _session: &AgentSession, csap: CsapHandle) -> TapiResult<u32> {
        self.with_csap(csap, |c| {
            c.armed = None;
            Ok(c.matched)
        })
    }

    async fn tcp_accept(
        &self,
        _session: &AgentSession,
        listen: CsapHandle,
        _timeout: RecvTimeout,
    ) -> TapiResult<i32> {
        if !self.csaps.lock().unwrap().contains_key(&listen.0) {
            return Err(TapiError::NotFound(format!("CSAP {listen}")));
        }
        self.accept_fd
            .lock()
            .unwrap()
            .ok_or_else(|| TapiError::TimedOut("no connection to accept".into()))
    }
}
