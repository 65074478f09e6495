//! Simulated Cloud Backend
//!
//! In-process provider used in standalone mode and in tests. It keeps the
//! selector semantics of the real drivers (EC2 lists running machines by tag,
//! SoftLayer and HP Cloud match a name prefix) and can inject faults and
//! latency per operation.

use crate::domain::{
    CloudBackend, ConnectDetails, ExecOutput, MachineCredentials, MachineOptions, MachineState,
    NodeHandle, NodeSelector, ProviderKind, SshDetails,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Fault Plan
// =============================================================================

/// Faults and latency injected into backend calls
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail every create with this reason
    pub fail_create: Option<String>,
    /// Create at most this many machines, then report a partial failure
    pub partial_create_after: Option<u32>,
    /// Fail every delete with this reason
    pub fail_delete: Option<String>,
    /// Fail every script run with this reason
    pub fail_script: Option<String>,
    /// Exit status reported by script runs
    pub script_exit_status: i32,
    pub create_delay: Duration,
    pub delete_delay: Duration,
    pub script_delay: Duration,
}

// =============================================================================
// Simulated Backend
// =============================================================================

/// A provider account simulated in memory
pub struct SimulatedBackend {
    kind: ProviderKind,
    connected: AtomicBool,
    machines: RwLock<BTreeMap<String, NodeHandle>>,
    faults: Mutex<FaultPlan>,
    machine_seq: AtomicU64,
    /// (ip, script) of every script run
    executions: Mutex<Vec<(String, String)>>,
}

impl SimulatedBackend {
    pub fn new(kind: ProviderKind) -> Self {
        Self::with_faults(kind, FaultPlan::default())
    }

    pub fn with_faults(kind: ProviderKind, faults: FaultPlan) -> Self {
        Self {
            kind,
            connected: AtomicBool::new(false),
            machines: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(faults),
            machine_seq: AtomicU64::new(0),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Replace the fault plan
    pub fn set_faults(&self, faults: FaultPlan) {
        *self.faults.lock() = faults;
    }

    /// Number of machines currently alive at the provider
    pub async fn machine_count(&self) -> usize {
        self.machines.read().await.len()
    }

    /// Scripts run so far, as (ip, script)
    pub fn executions(&self) -> Vec<(String, String)> {
        self.executions.lock().clone()
    }

    fn ensure_connected(&self, operation: &str) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::backend(self.kind, operation, "not connected"))
        }
    }

    fn new_machine(&self, group: &str, options: &MachineOptions) -> NodeHandle {
        let seq = self.machine_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = match self.kind {
            ProviderKind::Ec2 => format!("i-{:08x}", seq),
            ProviderKind::Softlayer => format!("{}", 3_000_000 + seq),
            ProviderKind::HpCloud => format!("az-1.region-a.geo-1/{}", seq),
        };
        let user = match self.kind {
            ProviderKind::Ec2 => "ec2-user",
            ProviderKind::Softlayer => "root",
            ProviderKind::HpCloud => "ubuntu",
        };

        let mut tags = options.tags.clone();
        tags.push(group.to_string());

        NodeHandle {
            id,
            name: format!("{}-{}", group, seq),
            state: MachineState::Running,
            public_ip: Some(format!("10.{}.{}.{}", (seq >> 16) & 0xff, (seq >> 8) & 0xff, seq & 0xff)),
            private_ip: Some(format!("192.168.{}.{}", (seq >> 8) & 0xff, seq & 0xff)),
            credentials: Some(MachineCredentials {
                user: user.to_string(),
                password: Some(format!("pw-{}", seq)),
                private_key: None,
            }),
            tags,
        }
    }
}

#[async_trait]
impl CloudBackend for SimulatedBackend {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self, details: &ConnectDetails) -> Result<()> {
        if details.identity.is_empty() {
            return Err(Error::backend(self.kind, "connect", "missing identity"));
        }
        info!(provider = %self.kind, identity = %details.identity, "Connected to provider");
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn list_nodes(&self, selector: &NodeSelector) -> Result<Vec<NodeHandle>> {
        self.ensure_connected("list_nodes")?;
        let machines = self.machines.read().await;
        Ok(machines
            .values()
            .filter(|m| match selector {
                NodeSelector::Tag(tag) => {
                    m.state == MachineState::Running && m.tags.iter().any(|t| t == tag)
                }
                NodeSelector::NameMask(prefix) => m.name.starts_with(prefix.as_str()),
                NodeSelector::All => true,
            })
            .cloned()
            .collect())
    }

    async fn get_node(&self, machine_id: &str) -> Result<Option<NodeHandle>> {
        self.ensure_connected("get_node")?;
        Ok(self.machines.read().await.get(machine_id).cloned())
    }

    async fn create_nodes(
        &self,
        group: &str,
        count: u32,
        options: &MachineOptions,
    ) -> Result<Vec<NodeHandle>> {
        self.ensure_connected("create_nodes")?;
        let faults = self.faults.lock().clone();

        info!(provider = %self.kind, group, count, "Creating machines");
        tokio::time::sleep(faults.create_delay).await;

        if let Some(reason) = faults.fail_create {
            return Err(Error::backend(self.kind, "create_nodes", reason));
        }

        let limit = faults.partial_create_after.map_or(count, |n| n.min(count));
        let mut created = Vec::with_capacity(limit as usize);
        {
            let mut machines = self.machines.write().await;
            for _ in 0..limit {
                let machine = self.new_machine(group, options);
                machines.insert(machine.id.clone(), machine.clone());
                created.push(machine);
            }
        }

        if limit < count {
            return Err(Error::PartialCreation {
                created,
                reason: format!("provider capacity exhausted after {} of {}", limit, count),
            });
        }

        debug!(provider = %self.kind, group, created = created.len(), "Machines created");
        Ok(created)
    }

    async fn delete_node(&self, machine_id: &str) -> Result<()> {
        self.ensure_connected("delete_node")?;
        let faults = self.faults.lock().clone();
        tokio::time::sleep(faults.delete_delay).await;

        if let Some(reason) = faults.fail_delete {
            return Err(Error::backend(self.kind, "delete_node", reason));
        }

        match self.machines.write().await.remove(machine_id) {
            Some(_) => {
                info!(provider = %self.kind, machine_id, "Machine destroyed");
                Ok(())
            }
            None => Err(Error::backend(
                self.kind,
                "delete_node",
                format!("delete operation failed for server with id [{}]", machine_id),
            )),
        }
    }

    async fn reboot_node(&self, machine_id: &str) -> Result<()> {
        self.ensure_connected("reboot_node")?;
        if self.kind == ProviderKind::Softlayer {
            return Err(Error::Unsupported {
                provider: self.kind.to_string(),
                operation: "reboot_node".into(),
            });
        }

        let mut machines = self.machines.write().await;
        let machine = machines.get_mut(machine_id).ok_or_else(|| {
            Error::backend(self.kind, "reboot_node", format!("no server with id [{}]", machine_id))
        })?;
        machine.state = MachineState::Running;
        Ok(())
    }

    async fn run_script(&self, script: &str, ip: &str, ssh: &SshDetails) -> Result<ExecOutput> {
        self.ensure_connected("run_script")?;
        let faults = self.faults.lock().clone();

        debug!(provider = %self.kind, ip, user = %ssh.user, port = ssh.port, "Running script");
        tokio::time::sleep(faults.script_delay).await;

        if let Some(reason) = faults.fail_script {
            return Err(Error::backend(self.kind, "run_script", reason));
        }

        let known = self
            .machines
            .read()
            .await
            .values()
            .any(|m| m.public_ip.as_deref() == Some(ip));
        if !known {
            return Err(Error::backend(
                self.kind,
                "run_script",
                format!("Machine [{}] was not found", ip),
            ));
        }

        self.executions.lock().push((ip.to_string(), script.to_string()));

        Ok(ExecOutput {
            exit_status: faults.script_exit_status,
            output: format!("executed {} bytes", script.len()),
            error: String::new(),
        })
    }
}
