use tracing::debug;

use crate::entity::{Entity, EntityKind, keys};

/// Operator-provided pre-label applied to the fingerprinted hosts before
/// orchestration.
#[derive(Clone, Debug, Default)]
pub struct Hint {
    pub ip: String,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub kind: Option<EntityKind>,
    /// Environment variable holding an API token for this endpoint.
    pub token_env_key: Option<String>,
}

/// Apply hints in order. A name override always wins; a kind override only
/// applies while the entity is still `Unknown`. A hint for an address the
/// sweep never saw creates the entity.
pub fn apply_hints(universe: &mut Vec<Entity>, hints: &[Hint]) {
    for hint in hints {
        let index = match universe.iter().position(|entity| entity.ip == hint.ip) {
            Some(index) => index,
            None => {
                debug!(ip = %hint.ip, "hint for unswept address, creating entity");
                universe.push(Entity::unknown(hint.ip.clone()));
                universe.len() - 1
            }
        };
        let entity = &mut universe[index];

        if let Some(name) = &hint.name {
            entity.name.clone_from(name);
        }
        if let Some(kind) = hint.kind
            && entity.kind == EntityKind::Unknown
        {
            entity.kind = kind;
        }
        if let Some(port) = hint.port {
            entity.open_ports.insert(port);
        }
        if let Some(env_key) = &hint.token_env_key {
            entity.set_meta(keys::HINT_TOKEN_ENV, env_key.as_str());
        }
    }
}
