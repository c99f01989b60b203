use serde::Deserialize;

/// Topic patterns a principal may publish and subscribe to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub superuser: bool,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(flatten)]
    pub permissions: Permissions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Certificate {
    pub common_name: String,
    #[serde(flatten)]
    pub permissions: Permissions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub anonymous: Permissions,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
}
