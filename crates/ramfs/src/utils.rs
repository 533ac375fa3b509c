use {
    nix::unistd::{self, Uid},
    p9srv::users::{SimpleUser, User, Users},
    std::{
        sync::Arc,
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Seconds since the epoch, as carried by `Stat`.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Resolves 9P identities against the host's user database.
pub struct UnixUsers;

fn simple_user(user: unistd::User) -> Arc<dyn User> {
    Arc::new(SimpleUser {
        name: user.name,
        id: user.uid.as_raw(),
    })
}

impl Users for UnixUsers {
    fn uid2user(&self, uid: u32) -> Option<Arc<dyn User>> {
        unistd::User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(simple_user)
    }

    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>> {
        unistd::User::from_name(uname).ok().flatten().map(simple_user)
    }
}

/// The user and group the server runs as, owners of the root directory.
pub fn process_owner() -> (Arc<dyn User>, String, u32) {
    let uid = unistd::getuid();
    let gid = unistd::getgid();

    let user = unistd::User::from_uid(uid)
        .ok()
        .flatten()
        .map(simple_user)
        .unwrap_or_else(|| {
            Arc::new(SimpleUser {
                name: uid.to_string(),
                id: uid.as_raw(),
            })
        });
    let group = unistd::Group::from_gid(gid)
        .ok()
        .flatten()
        .map_or_else(|| gid.to_string(), |g| g.name);

    (user, group, gid.as_raw())
}
