//! Typed operations against the integration bridge: every public
//! operation is a single multi-statement OVSDB transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{
    OvsdbConnection, OvsdbError, is_wait_timeout, map_from_ovsdb, operation_error, ovsdb_map,
    ovsdb_named_uuid_set, ovsdb_string_set, ovsdb_uuid_set, uuid_from_ovsdb, uuid_list_from_ovsdb,
};

const OPENFLOW_PROTO_V10: &str = "OpenFlow10";
const OPENFLOW_PROTO_V13: &str = "OpenFlow13";

// Named uuids binding the three statements of a port creation together.
const IFACE_ROW: &str = "row_interface";
const PORT_ROW: &str = "row_port";
const BRIDGE_ROW: &str = "row_bridge";

/// How long an `ofport` lookup waits for OVS to materialize the port
/// number before reporting it as unassigned.
const OFPORT_WAIT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    Vxlan,
    Geneve,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Vxlan => "vxlan",
            TunnelType::Geneve => "geneve",
        }
    }
}

impl std::str::FromStr for TunnelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vxlan" => Ok(TunnelType::Vxlan),
            "geneve" => Ok(TunnelType::Geneve),
            other => Err(format!("unknown tunnel type {other}")),
        }
    }
}

/// One Port row joined with its Interface row, as read back from OVSDB.
#[derive(Debug, Clone, Default)]
pub struct OvsPortData {
    pub uuid: String,
    pub name: String,
    pub ifname: String,
    /// 0 until OVS assigns the OpenFlow port number.
    pub ofport: i32,
    pub external_ids: HashMap<String, String>,
}

/// The seam between the agent and OVSDB; the production implementation
/// is [`OvsBridge`], tests substitute their own.
#[async_trait]
pub trait OvsBridgeClient: Send + Sync {
    /// Looks up or creates the bridge, enabling OpenFlow 1.0 and 1.3.
    async fn create(&self) -> Result<(), OvsdbError>;
    async fn delete(&self) -> Result<(), OvsdbError>;
    async fn external_ids(&self) -> Result<HashMap<String, String>, OvsdbError>;
    async fn set_external_ids(&self, ids: &HashMap<String, String>) -> Result<(), OvsdbError>;
    async fn port_uuid_list(&self) -> Result<Vec<String>, OvsdbError>;
    /// Creates a port attached to the host device `ifname`; returns the
    /// Port row uuid.
    async fn create_port(
        &self,
        name: &str,
        ifname: &str,
        external_ids: &HashMap<String, String>,
    ) -> Result<String, OvsdbError>;
    async fn create_internal_port(
        &self,
        name: &str,
        ofport_request: i32,
        external_ids: &HashMap<String, String>,
    ) -> Result<String, OvsdbError>;
    /// Creates a tunnel port. Without a remote IP the tunnel is flow
    /// based (`remote_ip=flow`, `key=flow`).
    async fn create_tunnel_port(
        &self,
        name: &str,
        tunnel_type: TunnelType,
        ofport_request: i32,
        remote_ip: Option<std::net::IpAddr>,
    ) -> Result<String, OvsdbError>;
    async fn delete_port(&self, port_uuid: &str) -> Result<(), OvsdbError>;
    async fn delete_ports(&self, port_uuids: &[String]) -> Result<(), OvsdbError>;
    /// Waits up to one second for the interface's ofport to be assigned
    /// and returns it; 0 means "not materialized yet", never an error.
    async fn ofport(&self, ifname: &str) -> Result<i32, OvsdbError>;
    /// Returns the port joined with the named interface, or `None` when
    /// the port row does not exist.
    async fn port_data(&self, port_uuid: &str, ifname: &str)
        -> Result<Option<OvsPortData>, OvsdbError>;
    async fn port_list(&self) -> Result<Vec<OvsPortData>, OvsdbError>;
    async fn set_interface_mtu(&self, ifname: &str, mtu: u32) -> Result<(), OvsdbError>;
}

pub struct OvsBridge {
    conn: OvsdbConnection,
    name: String,
    datapath_type: Option<String>,
    uuid: RwLock<Option<String>>,
}

impl OvsBridge {
    pub fn new(conn: OvsdbConnection, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
            datapath_type: None,
            uuid: RwLock::new(None),
        }
    }

    pub fn with_datapath_type(mut self, datapath_type: impl Into<String>) -> Self {
        self.datapath_type = Some(datapath_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn where_name(&self) -> Value {
        json!([["name", "==", self.name]])
    }

    async fn lookup_by_name(&self) -> Result<Option<String>, OvsdbError> {
        let ops = vec![json!({
            "op": "select",
            "table": "Bridge",
            "columns": ["_uuid"],
            "where": self.where_name(),
        })];
        let results = self.conn.transact(ops).await?;
        let row = results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first());
        let Some(row) = row else {
            return Ok(None);
        };
        let uuid = row
            .get("_uuid")
            .and_then(uuid_from_ovsdb)
            .ok_or_else(|| OvsdbError::permanent("bridge row without a uuid"))?;
        Ok(Some(uuid))
    }

    async fn update_protocols(&self) -> Result<(), OvsdbError> {
        let ops = vec![json!({
            "op": "update",
            "table": "Bridge",
            "where": self.where_name(),
            "row": {
                "protocols": ovsdb_string_set(&[
                    OPENFLOW_PROTO_V10.to_owned(),
                    OPENFLOW_PROTO_V13.to_owned(),
                ]),
            },
        })];
        self.conn.transact(ops).await?;
        Ok(())
    }

    async fn create_bridge(&self) -> Result<String, OvsdbError> {
        let mut row = serde_json::Map::new();
        row.insert("name".to_owned(), json!(self.name));
        row.insert(
            "protocols".to_owned(),
            ovsdb_string_set(&[
                OPENFLOW_PROTO_V10.to_owned(),
                OPENFLOW_PROTO_V13.to_owned(),
            ]),
        );
        if let Some(datapath_type) = &self.datapath_type {
            row.insert("datapath_type".to_owned(), json!(datapath_type));
        }
        let ops = vec![
            json!({
                "op": "insert",
                "table": "Bridge",
                "row": Value::Object(row),
                "uuid-name": BRIDGE_ROW,
            }),
            json!({
                "op": "mutate",
                "table": "Open_vSwitch",
                "where": [],
                "mutations": [["bridges", "insert", ovsdb_named_uuid_set(&[BRIDGE_ROW])]],
            }),
        ];
        let results = self.conn.transact(ops).await?;
        results
            .first()
            .and_then(|r| r.get("uuid"))
            .and_then(uuid_from_ovsdb)
            .ok_or_else(|| OvsdbError::permanent("bridge insert reply without a uuid"))
    }

    async fn insert_port(
        &self,
        name: &str,
        ifname: &str,
        iface_type: Option<&str>,
        ofport_request: i32,
        external_ids: Option<&HashMap<String, String>>,
        options: Option<&BTreeMap<String, String>>,
    ) -> Result<String, OvsdbError> {
        let ops = port_insert_ops(
            &self.name,
            name,
            ifname,
            iface_type,
            ofport_request,
            external_ids,
            options,
        );
        let results = self.conn.transact(ops).await?;
        // The Port row is the second insert of the transaction.
        results
            .get(1)
            .and_then(|r| r.get("uuid"))
            .and_then(uuid_from_ovsdb)
            .ok_or_else(|| OvsdbError::permanent("port insert reply without a uuid"))
    }
}

/// Builds the three-statement port creation transaction: insert the
/// Interface row, insert the Port row referencing it, and splice the
/// port into the bridge's `ports` set.
fn port_insert_ops(
    bridge_name: &str,
    name: &str,
    ifname: &str,
    iface_type: Option<&str>,
    ofport_request: i32,
    external_ids: Option<&HashMap<String, String>>,
    options: Option<&BTreeMap<String, String>>,
) -> Vec<Value> {
    let mut iface_row = serde_json::Map::new();
    iface_row.insert("name".to_owned(), json!(ifname));
    if let Some(iface_type) = iface_type {
        iface_row.insert("type".to_owned(), json!(iface_type));
    }
    if ofport_request != 0 {
        iface_row.insert("ofport_request".to_owned(), json!(ofport_request));
    }
    if let Some(options) = options {
        iface_row.insert("options".to_owned(), ovsdb_map(options));
    }

    let mut port_row = serde_json::Map::new();
    port_row.insert("name".to_owned(), json!(name));
    port_row.insert("interfaces".to_owned(), ovsdb_named_uuid_set(&[IFACE_ROW]));
    if let Some(external_ids) = external_ids {
        port_row.insert("external_ids".to_owned(), ovsdb_map(external_ids));
    }

    vec![
        json!({
            "op": "insert",
            "table": "Interface",
            "row": Value::Object(iface_row),
            "uuid-name": IFACE_ROW,
        }),
        json!({
            "op": "insert",
            "table": "Port",
            "row": Value::Object(port_row),
            "uuid-name": PORT_ROW,
        }),
        json!({
            "op": "mutate",
            "table": "Bridge",
            "where": [["name", "==", bridge_name]],
            "mutations": [["ports", "insert", ovsdb_named_uuid_set(&[PORT_ROW])]],
        }),
    ]
}

fn row_ofport(row: &Value) -> i32 {
    // An unassigned ofport reads back as ["set", []].
    row.get("ofport")
        .and_then(Value::as_i64)
        .map(|p| p as i32)
        .unwrap_or(0)
}

#[async_trait]
impl OvsBridgeClient for OvsBridge {
    async fn create(&self) -> Result<(), OvsdbError> {
        if let Some(uuid) = self.lookup_by_name().await? {
            info!("bridge exists: {uuid}");
            *self.uuid.write().unwrap() = Some(uuid);
            return self.update_protocols().await;
        }
        let uuid = self.create_bridge().await?;
        info!("created bridge: {uuid}");
        *self.uuid.write().unwrap() = Some(uuid);
        Ok(())
    }

    async fn delete(&self) -> Result<(), OvsdbError> {
        let current_uuid = self.uuid.read().unwrap().clone();
        let uuid = match current_uuid {
            Some(uuid) => uuid,
            None => self
                .lookup_by_name()
                .await?
                .ok_or_else(|| OvsdbError::not_found(format!("bridge {} not found", self.name)))?,
        };
        let ops = vec![json!({
            "op": "mutate",
            "table": "Open_vSwitch",
            "where": [],
            "mutations": [["bridges", "delete", ovsdb_uuid_set(&[uuid])]],
        })];
        self.conn.transact(ops).await?;
        Ok(())
    }

    async fn external_ids(&self) -> Result<HashMap<String, String>, OvsdbError> {
        let ops = vec![json!({
            "op": "select",
            "table": "Bridge",
            "columns": ["external_ids"],
            "where": self.where_name(),
        })];
        let results = self.conn.transact(ops).await?;
        let row = results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| OvsdbError::not_found(format!("bridge {} not found", self.name)))?;
        Ok(row
            .get("external_ids")
            .map(map_from_ovsdb)
            .unwrap_or_default())
    }

    async fn set_external_ids(&self, ids: &HashMap<String, String>) -> Result<(), OvsdbError> {
        let ops = vec![json!({
            "op": "update",
            "table": "Bridge",
            "where": self.where_name(),
            "row": {"external_ids": ovsdb_map(ids)},
        })];
        self.conn.transact(ops).await?;
        Ok(())
    }

    async fn port_uuid_list(&self) -> Result<Vec<String>, OvsdbError> {
        let ops = vec![json!({
            "op": "select",
            "table": "Bridge",
            "columns": ["ports"],
            "where": self.where_name(),
        })];
        let results = self.conn.transact(ops).await?;
        let row = results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| OvsdbError::not_found(format!("bridge {} not found", self.name)))?;
        Ok(row
            .get("ports")
            .map(uuid_list_from_ovsdb)
            .unwrap_or_default())
    }

    async fn create_port(
        &self,
        name: &str,
        ifname: &str,
        external_ids: &HashMap<String, String>,
    ) -> Result<String, OvsdbError> {
        self.insert_port(name, ifname, None, 0, Some(external_ids), None)
            .await
    }

    async fn create_internal_port(
        &self,
        name: &str,
        ofport_request: i32,
        external_ids: &HashMap<String, String>,
    ) -> Result<String, OvsdbError> {
        self.insert_port(
            name,
            name,
            Some("internal"),
            ofport_request,
            Some(external_ids),
            None,
        )
        .await
    }

    async fn create_tunnel_port(
        &self,
        name: &str,
        tunnel_type: TunnelType,
        ofport_request: i32,
        remote_ip: Option<std::net::IpAddr>,
    ) -> Result<String, OvsdbError> {
        let mut options = BTreeMap::new();
        match remote_ip {
            Some(ip) => {
                options.insert("remote_ip".to_owned(), ip.to_string());
            }
            None => {
                options.insert("key".to_owned(), "flow".to_owned());
                options.insert("remote_ip".to_owned(), "flow".to_owned());
            }
        }
        self.insert_port(
            name,
            name,
            Some(tunnel_type.as_str()),
            ofport_request,
            None,
            Some(&options),
        )
        .await
    }

    async fn delete_port(&self, port_uuid: &str) -> Result<(), OvsdbError> {
        self.delete_ports(&[port_uuid.to_owned()]).await
    }

    async fn delete_ports(&self, port_uuids: &[String]) -> Result<(), OvsdbError> {
        let ops = vec![json!({
            "op": "mutate",
            "table": "Bridge",
            "where": self.where_name(),
            "mutations": [["ports", "delete", ovsdb_uuid_set(port_uuids)]],
        })];
        self.conn.transact(ops).await?;
        Ok(())
    }

    async fn ofport(&self, ifname: &str) -> Result<i32, OvsdbError> {
        let ops = vec![
            json!({
                "op": "wait",
                "table": "Interface",
                "timeout": OFPORT_WAIT_TIMEOUT_MS,
                "columns": ["ofport"],
                "until": "!=",
                "rows": [{"ofport": ["set", []]}],
                "where": [["name", "==", ifname]],
            }),
            json!({
                "op": "select",
                "table": "Interface",
                "columns": ["ofport"],
                "where": [["name", "==", ifname]],
            }),
        ];
        let results = self.conn.transact_raw(ops).await?;
        for member in &results {
            if is_wait_timeout(member) {
                // Not assigned yet; callers treat 0 as "unknown".
                return Ok(0);
            }
            if let Some(err) = operation_error(member) {
                return Err(err);
            }
        }
        let row = results
            .get(1)
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| OvsdbError::not_found(format!("interface {ifname} not found")))?;
        Ok(row_ofport(row))
    }

    async fn port_data(
        &self,
        port_uuid: &str,
        ifname: &str,
    ) -> Result<Option<OvsPortData>, OvsdbError> {
        let ops = vec![
            json!({
                "op": "select",
                "table": "Port",
                "columns": ["name", "external_ids", "interfaces"],
                "where": [["_uuid", "==", ["uuid", port_uuid]]],
            }),
            json!({
                "op": "select",
                "table": "Interface",
                "columns": ["_uuid", "ofport"],
                "where": [["name", "==", ifname]],
            }),
        ];
        let results = self.conn.transact(ops).await?;
        let port_row = results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first());
        let Some(port_row) = port_row else {
            warn!("could not find port {port_uuid}");
            return Ok(None);
        };
        let iface_row = results
            .get(1)
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| OvsdbError::not_found(format!("interface {ifname} not found")))?;

        let iface_uuid = iface_row.get("_uuid").and_then(uuid_from_ovsdb);
        let attached = port_row
            .get("interfaces")
            .map(uuid_list_from_ovsdb)
            .unwrap_or_default();
        if iface_uuid.is_none() || !attached.contains(iface_uuid.as_ref().unwrap()) {
            return Err(OvsdbError::not_found(format!(
                "interface {ifname} is not attached to port {port_uuid}"
            )));
        }

        Ok(Some(OvsPortData {
            uuid: port_uuid.to_owned(),
            name: port_row
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            ifname: ifname.to_owned(),
            ofport: row_ofport(iface_row),
            external_ids: port_row
                .get("external_ids")
                .map(map_from_ovsdb)
                .unwrap_or_default(),
        }))
    }

    async fn port_list(&self) -> Result<Vec<OvsPortData>, OvsdbError> {
        let ops = vec![
            json!({
                "op": "select",
                "table": "Bridge",
                "columns": ["ports"],
                "where": self.where_name(),
            }),
            json!({
                "op": "select",
                "table": "Port",
                "columns": ["_uuid", "name", "external_ids", "interfaces"],
                "where": [],
            }),
            json!({
                "op": "select",
                "table": "Interface",
                "columns": ["_uuid", "name", "ofport"],
                "where": [],
            }),
        ];
        let results = self.conn.transact(ops).await?;
        let bridge_row = results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first());
        let Some(bridge_row) = bridge_row else {
            warn!("could not find bridge {}", self.name);
            return Ok(Vec::new());
        };
        let port_uuids = bridge_row
            .get("ports")
            .map(uuid_list_from_ovsdb)
            .unwrap_or_default();

        let rows_by_uuid = |index: usize| -> HashMap<String, &Value> {
            results
                .get(index)
                .and_then(|r| r.get("rows"))
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            row.get("_uuid").and_then(uuid_from_ovsdb).map(|u| (u, row))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let ports = rows_by_uuid(1);
        let ifaces = rows_by_uuid(2);

        let mut out = Vec::with_capacity(port_uuids.len());
        for uuid in port_uuids {
            let Some(port_row) = ports.get(&uuid) else {
                warn!("bridge references unknown port {uuid}");
                continue;
            };
            // A port carries exactly one interface on this bridge.
            let iface_row = port_row
                .get("interfaces")
                .map(uuid_list_from_ovsdb)
                .unwrap_or_default()
                .first()
                .and_then(|iface_uuid| ifaces.get(iface_uuid))
                .copied();
            let Some(iface_row) = iface_row else {
                warn!("port {uuid} has no interface row");
                continue;
            };
            out.push(OvsPortData {
                uuid,
                name: port_row
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                ifname: iface_row
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                ofport: row_ofport(iface_row),
                external_ids: port_row
                    .get("external_ids")
                    .map(map_from_ovsdb)
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn set_interface_mtu(&self, ifname: &str, mtu: u32) -> Result<(), OvsdbError> {
        let ops = vec![json!({
            "op": "update",
            "table": "Interface",
            "where": [["name", "==", ifname]],
            "row": {"mtu_request": mtu},
        })];
        self.conn.transact(ops).await?;
        Ok(())
    }
}
