//! Mesh topology snapshot exchanged during the join handshake

use serde::{Deserialize, Serialize};

use super::HostId;

/// One host as advertised to joining peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub host_id: HostId,
    pub address: String,
    pub port: u16,
    pub host_display_name: String,
}

impl HostInfo {
    pub fn new(
        host_id: HostId,
        address: impl Into<String>,
        port: u16,
        host_display_name: impl Into<String>,
    ) -> Self {
        Self {
            host_id,
            address: address.into(),
            port,
            host_display_name: host_display_name.into(),
        }
    }

    /// Address suitable for `TcpStream::connect`
    pub fn connect_target(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Immutable list of hosts known to the party answering a join request.
/// The leader is always the first entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshTopology {
    hosts: Vec<HostInfo>,
}

impl MeshTopology {
    pub fn new(hosts: Vec<HostInfo>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[HostInfo] {
        &self.hosts
    }

    pub fn leader(&self) -> Option<&HostInfo> {
        self.hosts.first()
    }

    /// Every host except the leader
    pub fn followers(&self) -> &[HostInfo] {
        self.hosts.get(1..).unwrap_or(&[])
    }

    pub fn get(&self, host_id: HostId) -> Option<&HostInfo> {
        self.hosts.iter().find(|h| h.host_id == host_id)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn into_hosts(self) -> Vec<HostInfo> {
        self.hosts
    }
}

impl FromIterator<HostInfo> for MeshTopology {
    fn from_iter<T: IntoIterator<Item = HostInfo>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_info_json_shape() {
        let info = HostInfo::new(3, "10.0.0.3", 3021, "node-c");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["hostId"], 3);
        assert_eq!(json["address"], "10.0.0.3");
        assert_eq!(json["port"], 3021);
        assert_eq!(json["hostDisplayName"], "node-c");
    }

    #[test]
    fn test_connect_target() {
        assert_eq!(
            HostInfo::new(0, "127.0.0.1", 4000, "a").connect_target(),
            "127.0.0.1:4000"
        );
        assert_eq!(HostInfo::new(0, "::1", 4000, "a").connect_target(), "[::1]:4000");
    }

    #[test]
    fn test_topology_leader_first() {
        let topology: MeshTopology = vec![
            HostInfo::new(0, "10.0.0.1", 3021, "a"),
            HostInfo::new(1, "10.0.0.2", 3021, "b"),
            HostInfo::new(2, "10.0.0.3", 3021, "c"),
        ]
        .into_iter()
        .collect();

        assert_eq!(topology.leader().map(|h| h.host_id), Some(0));
        assert_eq!(topology.followers().len(), 2);
        assert_eq!(topology.get(2).map(|h| h.host_display_name.as_str()), Some("c"));
        assert!(MeshTopology::default().followers().is_empty());
    }
}
