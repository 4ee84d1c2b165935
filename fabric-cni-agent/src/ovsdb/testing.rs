//! Scriptable [`OvsBridgeClient`] used by unit tests across the crate.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::bridge::{OvsBridgeClient, OvsPortData, TunnelType};
use super::OvsdbError;

/// Hand-rolled mock: queue results for the calls a test cares about and
/// inspect the recorded invocations afterwards. Calls without a queued
/// result succeed with an empty/default value.
#[derive(Default)]
pub struct MockOvsBridgeClient {
    pub port_list_results: Mutex<VecDeque<Result<Vec<OvsPortData>, OvsdbError>>>,
    pub create_port_results: Mutex<VecDeque<Result<String, OvsdbError>>>,
    pub ofport_results: Mutex<VecDeque<Result<i32, OvsdbError>>>,
    pub delete_port_results: Mutex<VecDeque<Result<(), OvsdbError>>>,

    pub created_ports: Mutex<Vec<(String, String, HashMap<String, String>)>>,
    pub deleted_ports: Mutex<Vec<String>>,
}

impl MockOvsBridgeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_port_list(&self, result: Result<Vec<OvsPortData>, OvsdbError>) {
        self.port_list_results.lock().unwrap().push_back(result);
    }

    pub fn queue_create_port(&self, result: Result<String, OvsdbError>) {
        self.create_port_results.lock().unwrap().push_back(result);
    }

    pub fn queue_ofport(&self, result: Result<i32, OvsdbError>) {
        self.ofport_results.lock().unwrap().push_back(result);
    }

    pub fn queue_delete_port(&self, result: Result<(), OvsdbError>) {
        self.delete_port_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl OvsBridgeClient for MockOvsBridgeClient {
    async fn create(&self) -> Result<(), OvsdbError> {
        Ok(())
    }

    async fn delete(&self) -> Result<(), OvsdbError> {
        Ok(())
    }

    async fn external_ids(&self) -> Result<HashMap<String, String>, OvsdbError> {
        Ok(HashMap::new())
    }

    async fn set_external_ids(&self, _ids: &HashMap<String, String>) -> Result<(), OvsdbError> {
        Ok(())
    }

    async fn port_uuid_list(&self) -> Result<Vec<String>, OvsdbError> {
        Ok(Vec::new())
    }

    async fn create_port(
        &self,
        name: &str,
        ifname: &str,
        external_ids: &HashMap<String, String>,
    ) -> Result<String, OvsdbError> {
        self.created_ports.lock().unwrap().push((
            name.to_owned(),
            ifname.to_owned(),
            external_ids.clone(),
        ));
        self.create_port_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("uuid-{name}")))
    }

    async fn create_internal_port(
        &self,
        name: &str,
        _ofport_request: i32,
        external_ids: &HashMap<String, String>,
    ) -> Result<String, OvsdbError> {
        self.created_ports.lock().unwrap().push((
            name.to_owned(),
            name.to_owned(),
            external_ids.clone(),
        ));
        Ok(format!("uuid-{name}"))
    }

    async fn create_tunnel_port(
        &self,
        name: &str,
        _tunnel_type: TunnelType,
        _ofport_request: i32,
        _remote_ip: Option<IpAddr>,
    ) -> Result<String, OvsdbError> {
        self.created_ports
            .lock()
            .unwrap()
            .push((name.to_owned(), name.to_owned(), HashMap::new()));
        Ok(format!("uuid-{name}"))
    }

    async fn delete_port(&self, port_uuid: &str) -> Result<(), OvsdbError> {
        self.deleted_ports.lock().unwrap().push(port_uuid.to_owned());
        self.delete_port_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn delete_ports(&self, port_uuids: &[String]) -> Result<(), OvsdbError> {
        self.deleted_ports
            .lock()
            .unwrap()
            .extend(port_uuids.iter().cloned());
        Ok(())
    }

    async fn ofport(&self, _ifname: &str) -> Result<i32, OvsdbError> {
        self.ofport_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(1))
    }

    async fn port_data(
        &self,
        _port_uuid: &str,
        _ifname: &str,
    ) -> Result<Option<OvsPortData>, OvsdbError> {
        Ok(None)
    }

    async fn port_list(&self) -> Result<Vec<OvsPortData>, OvsdbError> {
        self.port_list_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn set_interface_mtu(&self, _ifname: &str, _mtu: u32) -> Result<(), OvsdbError> {
        Ok(())
    }
}
