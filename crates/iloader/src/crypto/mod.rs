//! Certificates, keys, CMS signatures and provisioning profiles.

pub mod cms;
pub mod identity;
pub mod profile;

pub use identity::{generate_csr, PendingKey, SigningIdentity};
pub use profile::ProvisioningProfile;
