use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute values keyed by `namespace:name`.
pub type AttributeMap = BTreeMap<String, Value>;

/// Driver-private variables persisted alongside the attributes.
pub type VariableMap = BTreeMap<String, Value>;

pub const NS_BASE: &str = "base";
pub const NS_DEVICE: &str = "dev";
pub const NS_DEVICE_ADVANCED: &str = "devadv";
pub const NS_DEVICE_CONNECTION: &str = "devconn";

/// Namespaces every driver supports regardless of its declared capabilities.
pub const CORE_NAMESPACES: [&str; 3] = [NS_BASE, NS_DEVICE, NS_DEVICE_ADVANCED];

pub const ATTR_CAPS: &str = "base:caps";
pub const ATTR_PRODUCT_ID: &str = "dev:productId";
pub const ATTR_HUB_LOCAL: &str = "devadv:hubLocal";
pub const ATTR_DEGRADED_CODE: &str = "devadv:degradedCode";
pub const ATTR_DRIVER_NAME: &str = "devadv:drivername";
pub const ATTR_DRIVER_VERSION: &str = "devadv:driverversion";
pub const ATTR_CONNECTION_STATE: &str = "devconn:state";

pub const CONNECTION_ONLINE: &str = "ONLINE";
pub const CONNECTION_OFFLINE: &str = "OFFLINE";

/// Attributes every context accepts even when no capability declares them.
pub const CORE_ATTRIBUTES: [&str; 7] = [
    ATTR_CAPS,
    ATTR_PRODUCT_ID,
    ATTR_HUB_LOCAL,
    ATTR_DEGRADED_CODE,
    ATTR_DRIVER_NAME,
    ATTR_DRIVER_VERSION,
    ATTR_CONNECTION_STATE,
];

/// Namespace part of an attribute key; keys without a `:` are their own namespace.
#[inline]
pub fn namespace_of(key: &str) -> &str {
    key.split_once(':').map(|(ns, _)| ns).unwrap_or(key)
}

#[inline]
pub fn is_core_namespace(namespace: &str) -> bool {
    CORE_NAMESPACES.contains(&namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_split() {
        assert_eq!(namespace_of("swit:state"), "swit");
        assert_eq!(namespace_of("bare"), "bare");
        assert!(is_core_namespace(namespace_of(ATTR_HUB_LOCAL)));
        assert!(!is_core_namespace(namespace_of(ATTR_CONNECTION_STATE)));
    }
}
