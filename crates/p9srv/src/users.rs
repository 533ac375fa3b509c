//! Identity resolution for `TAuth`/`TAttach`.

use std::{collections::HashMap, fmt, sync::Arc};

/// An identity a fid acts on behalf of.
pub trait User: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn id(&self) -> u32;
}

/// Resolves the user named in a request. Lookups return `None` for unknown users.
pub trait Users: Send + Sync {
    fn uid2user(&self, uid: u32) -> Option<Arc<dyn User>>;
    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>>;
}

/// A plain name/id pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleUser {
    pub name: String,
    pub id: u32,
}

impl User for SimpleUser {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> u32 {
        self.id
    }
}

/// Fixed user table.
#[derive(Clone, Debug, Default)]
pub struct UserTable {
    by_id: HashMap<u32, Arc<SimpleUser>>,
    by_name: HashMap<String, Arc<SimpleUser>>,
}

impl UserTable {
    pub fn new() -> UserTable {
        Default::default()
    }

    pub fn with(mut self, name: &str, id: u32) -> UserTable {
        self.add(name, id);
        self
    }

    pub fn add(&mut self, name: &str, id: u32) {
        let user = Arc::new(SimpleUser {
            name: name.to_owned(),
            id,
        });
        self.by_id.insert(id, user.clone());
        self.by_name.insert(name.to_owned(), user);
    }
}

impl Users for UserTable {
    fn uid2user(&self, uid: u32) -> Option<Arc<dyn User>> {
        self.by_id.get(&uid).map(|u| u.clone() as Arc<dyn User>)
    }

    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>> {
        self.by_name.get(uname).map(|u| u.clone() as Arc<dyn User>)
    }
}
