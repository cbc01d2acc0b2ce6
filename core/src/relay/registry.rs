//! Name Registry — unique pseudonyms for live connections

use rand::seq::SliceRandom;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Maximum draws from the generator before giving up on a unique name
pub const MAX_NAME_ATTEMPTS: usize = 64;

/// Opaque handle for one live transport connection
pub type ConnectionId = Uuid;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "bold", "brave", "bright", "calm", "clever", "cosmic", "crimson", "curious",
    "daring", "dusty", "eager", "fancy", "fuzzy", "gentle", "giant", "golden", "happy", "hidden",
    "humble", "icy", "jolly", "kind", "lively", "lucky", "mellow", "misty", "nimble", "noble",
    "odd", "patient", "plucky", "polite", "proud", "quick", "quiet", "rapid", "rusty", "shiny",
    "silent", "sleepy", "snowy", "solar", "spicy", "steady", "sunny", "swift", "tidy", "velvet",
    "vivid", "wild", "windy", "wise", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "bison", "canyon", "comet", "coral", "crane", "dolphin", "ember", "falcon",
    "fern", "fox", "gecko", "glacier", "harbor", "hawk", "heron", "island", "jackal", "kettle",
    "koala", "lantern", "lemur", "lynx", "maple", "meadow", "meteor", "moose", "nebula", "otter",
    "owl", "panda", "pebble", "pepper", "pine", "quokka", "raven", "reef", "river", "robin",
    "sparrow", "spruce", "summit", "thistle", "tiger", "tulip", "valley", "walrus", "willow",
    "wombat", "yak", "zephyr",
];

/// Source of human-readable candidate names
#[cfg_attr(test, mockall::automock)]
pub trait NameGenerator: Send {
    /// Produce a candidate name; uniqueness is enforced by the registry
    fn generate(&mut self) -> String;
}

/// Adjective-noun names such as `quiet-heron`
#[derive(Debug, Default, Clone, Copy)]
pub struct MonikerGenerator;

impl NameGenerator for MonikerGenerator {
    fn generate(&mut self) -> String {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("anonymous");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("peer");
        format!("{}-{}", adjective, noun)
    }
}

/// Registry error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No unique name found after {0} attempts")]
    NamesExhausted(usize),
    #[error("Connection {0} already has a name")]
    AlreadyRegistered(ConnectionId),
}

/// Maps pseudonyms to the connection currently holding them
pub struct NameRegistry {
    generator: Box<dyn NameGenerator>,
    by_name: HashMap<String, ConnectionId>,
    by_connection: HashMap<ConnectionId, String>,
}

impl NameRegistry {
    /// Create a registry with the default moniker generator
    pub fn new() -> Self {
        Self::with_generator(Box::new(MonikerGenerator))
    }

    /// Create a registry with a custom generator
    pub fn with_generator(generator: Box<dyn NameGenerator>) -> Self {
        Self {
            generator,
            by_name: HashMap::new(),
            by_connection: HashMap::new(),
        }
    }

    /// Assign a fresh pseudonym to a connection
    pub fn assign(&mut self, connection: ConnectionId) -> Result<String, RegistryError> {
        if self.by_connection.contains_key(&connection) {
            return Err(RegistryError::AlreadyRegistered(connection));
        }

        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = self.generator.generate();
            if name.is_empty() || self.by_name.contains_key(&name) {
                continue;
            }
            self.by_name.insert(name.clone(), connection);
            self.by_connection.insert(connection, name.clone());
            return Ok(name);
        }

        Err(RegistryError::NamesExhausted(MAX_NAME_ATTEMPTS))
    }

    /// Free a name. Returns the connection that held it.
    pub fn release(&mut self, name: &str) -> Option<ConnectionId> {
        let connection = self.by_name.remove(name)?;
        self.by_connection.remove(&connection);
        Some(connection)
    }

    /// Connection currently holding `name`
    pub fn lookup(&self, name: &str) -> Option<ConnectionId> {
        self.by_name.get(name).copied()
    }

    /// Name held by `connection`
    pub fn name_of(&self, connection: &ConnectionId) -> Option<&str> {
        self.by_connection.get(connection).map(String::as_str)
    }

    /// All live names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
