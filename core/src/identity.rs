/// Node identity: RSA key pair, derived node id, and peer URLs
use crate::error::{BenchError, Result};
use base64::{engine::general_purpose, Engine as _};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

const KEY_BITS: usize = 2048;
const URL_SCHEME: &str = "mesh://";

/// Node identifier: base58 of the SHA-256 of the node's public key (DER)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| BenchError::Config(format!("Invalid node id {:?}: {}", s, e)))?;
        if bytes.len() != 32 {
            return Err(BenchError::Config(format!(
                "Invalid node id {:?}: expected 32 bytes, got {}",
                s,
                bytes.len()
            )));
        }
        Ok(Self(s.to_string()))
    }
}

/// Generate node_id from public key (base58 encoded hash)
fn derive_node_id(public_key: &RsaPublicKey) -> Result<NodeId> {
    let public_key_der = public_key
        .to_public_key_der()
        .map_err(|e| BenchError::Crypto(format!("Failed to serialize public key: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(public_key_der.as_bytes());
    let hash = hasher.finalize();

    Ok(NodeId(bs58::encode(&hash[..]).into_string()))
}

/// Check a peer's claimed node id against the public key it presented
pub fn verify_node_id(claimed: &str, public_key: &str) -> Result<NodeId> {
    let der = general_purpose::STANDARD
        .decode(public_key)
        .map_err(|e| BenchError::Crypto(format!("Invalid base64 public key: {}", e)))?;
    let key = RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| BenchError::Crypto(format!("Invalid public key: {}", e)))?;
    let derived = derive_node_id(&key)?;
    if derived.as_str() != claimed {
        return Err(BenchError::Crypto(format!(
            "Node id {} does not match its public key ({})",
            claimed, derived
        )));
    }
    Ok(derived)
}

/// Identity of a running node
#[derive(Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    private_key: Arc<RsaPrivateKey>,
}

impl NodeIdentity {
    /// Generate a fresh key pair
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| BenchError::Crypto(format!("Failed to generate RSA key: {}", e)))?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let node_id = derive_node_id(&RsaPublicKey::from(&private_key))?;
        Ok(Self {
            node_id,
            private_key: Arc::new(private_key),
        })
    }

    /// Public key as base64-encoded DER
    pub fn public_key_string(&self) -> Result<String> {
        let der = RsaPublicKey::from(self.private_key.as_ref())
            .to_public_key_der()
            .map_err(|e| BenchError::Crypto(format!("Failed to serialize public key: {}", e)))?;
        Ok(general_purpose::STANDARD.encode(der.as_bytes()))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFileV1 {
    version: u8,
    node_id: String,
    rsa_private_key_pkcs8_b64: String,
}

fn identity_path(data_dir: &Path) -> PathBuf {
    data_dir.join("keys").join("identity.json")
}

/// Load the identity stored under `data_dir`, creating one on first use.
///
/// Mail servers use this so their peer URL survives restarts.
pub fn load_or_create(data_dir: &Path) -> Result<NodeIdentity> {
    let path = identity_path(data_dir);
    if path.exists() {
        let raw = fs::read_to_string(&path)?;
        let parsed: IdentityFileV1 = serde_json::from_str(&raw)?;
        if parsed.version != 1 {
            return Err(BenchError::Config(format!(
                "Unsupported identity file version: {}",
                parsed.version
            )));
        }

        let pkcs8 = general_purpose::STANDARD
            .decode(parsed.rsa_private_key_pkcs8_b64)
            .map_err(|e| BenchError::Config(format!("Invalid base64 in identity: {}", e)))?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&pkcs8)
            .map_err(|e| BenchError::Crypto(format!("Invalid private key: {}", e)))?;

        let identity = NodeIdentity::from_private_key(private_key)?;
        if identity.node_id.as_str() != parsed.node_id {
            return Err(BenchError::Config(format!(
                "Identity file {} does not match its key",
                path.display()
            )));
        }
        return Ok(identity);
    }

    let identity = NodeIdentity::generate()?;
    let pkcs8 = identity
        .private_key
        .to_pkcs8_der()
        .map_err(|e| BenchError::Crypto(format!("Failed to encode private key: {}", e)))?;
    let file = IdentityFileV1 {
        version: 1,
        node_id: identity.node_id.to_string(),
        rsa_private_key_pkcs8_b64: general_purpose::STANDARD.encode(pkcs8.as_bytes()),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_string_pretty(&file)?)?;

    // Best-effort file permissions (0600)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
    }

    Ok(identity)
}

/// Address of a remote peer: `mesh://<node_id>@<ip>:<port>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerUrl {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl PeerUrl {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", URL_SCHEME, self.id, self.addr)
    }
}

impl FromStr for PeerUrl {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix(URL_SCHEME).unwrap_or(s);
        let (id, addr) = rest.split_once('@').ok_or_else(|| {
            BenchError::Config(format!("Invalid peer URL {:?}: expected <node_id>@<ip>:<port>", s))
        })?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| BenchError::Config(format!("Invalid peer address {:?}: {}", addr, e)))?;
        Ok(Self {
            id: id.parse()?,
            addr,
        })
    }
}
