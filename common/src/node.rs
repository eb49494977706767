use std::{collections::HashSet, fmt, fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;

pub type NodeId = u32;

const KEY_PREFIX: &str = "key:";

/// Credencial en texto plano tal como viene del inventario.
///
/// `"key:/ruta/id_ed25519"` apunta a una llave SSH; cualquier otro valor es
/// una contraseña.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

impl From<String> for Credential {
    fn from(raw: String) -> Self {
        match raw.strip_prefix(KEY_PREFIX) {
            Some(path) => Credential::KeyFile(PathBuf::from(path)),
            None => Credential::Password(raw),
        }
    }
}

impl From<Credential> for String {
    fn from(c: Credential) -> Self {
        match c {
            Credential::Password(p) => p,
            Credential::KeyFile(path) => format!("{}{}", KEY_PREFIX, path.display()),
        }
    }
}

// nunca imprimir contraseñas en logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
        }
    }
}

/// Un nodo remoto del inventario. Es una entrada inmutable: el orquestador
/// sólo lo recorre, nunca lo crea ni lo destruye.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub credential: Credential,

    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Unidad de trabajo ligada a este nodo durante todo el pipeline
    /// (ej: la lista de archivos WET que le toca procesar).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Vec<String>>,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>, credential: Credential) -> Self {
        Self {
            id,
            address: address.into(),
            credential,
            user: default_user(),
            port: default_port(),
            assignment: None,
        }
    }

    pub fn with_assignment(mut self, items: Vec<String>) -> Self {
        self.assignment = Some(items);
        self
    }

    /// Nombre corto para logs y consola, ej: `node-07`.
    pub fn label(&self) -> String {
        format!("node-{:02}", self.id)
    }
}

/* --------- Inventario --------- */

/// Chequeos de presencia; no valida nada más allá de eso.
pub fn validate_inventory(nodes: &[Node]) -> Result<(), PlanError> {
    if nodes.is_empty() {
        return Err(PlanError::EmptyInventory);
    }

    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.id) {
            return Err(PlanError::DuplicateNodeId(node.id));
        }
        if node.address.trim().is_empty() {
            return Err(PlanError::MissingAddress(node.id));
        }
    }
    Ok(())
}

pub fn load_inventory(path: &Path) -> Result<Vec<Node>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer el inventario {}", path.display()))?;
    let nodes: Vec<Node> = serde_json::from_str(&raw)
        .with_context(|| format!("inventario inválido en {}", path.display()))?;
    validate_inventory(&nodes)?;
    Ok(nodes)
}

pub fn save_inventory(path: &Path, nodes: &[Node]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_string_pretty(nodes)?;
    fs::write(path, body + "\n")
        .with_context(|| format!("no se pudo escribir el inventario {}", path.display()))?;
    Ok(())
}

/// Reparte `items` en trozos contiguos de `ceil(len / nodos)` y asigna el
/// trozo i al nodo i. Los últimos nodos pueden quedar con una lista vacía.
pub fn distribute(nodes: &mut [Node], items: Vec<String>) -> Result<(), PlanError> {
    if nodes.is_empty() {
        return Err(PlanError::EmptyInventory);
    }

    let chunk_size = items.len().div_ceil(nodes.len()).max(1);
    let mut chunks = items.chunks(chunk_size);

    for node in nodes.iter_mut() {
        let chunk = chunks.next().map(|c| c.to_vec()).unwrap_or_default();
        node.assignment = Some(chunk);
    }
    Ok(())
}
