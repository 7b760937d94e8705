//! SAML2 Web Browser SSO and Single Logout
//!
//! Service provider side only: AuthnRequest and LogoutRequest emission,
//! `Response` validation, and IdP- or SP-initiated single logout over the
//! HTTP-Redirect, HTTP-POST and SOAP bindings. XML signature verification
//! and decryption are delegated to [`TrustEngine`] and [`Decrypter`].

pub mod binding;
pub mod client;
pub mod config;
pub mod logout_validator;
pub mod messages;
pub mod model;
pub mod parser;
pub mod response_validator;
pub mod trust;
pub mod xml;

pub use binding::{decode_inbound, RedirectSignature, SamlBinding, SamlInbound};
pub use client::{Saml2Client, Saml2ClientBuilder};
pub use config::{
    IdpMetadata, IdpMetadataResolver, OutboundBinding, Saml2ClientConfig,
    StaticIdpMetadataResolver,
};
pub use logout_validator::{LogoutResponseStatus, Saml2LogoutValidator, ValidatedLogoutRequest};
pub use model::{NameId, SamlAttribute, SamlMessage, Status};
pub use parser::parse_message;
pub use response_validator::Saml2ResponseValidator;
pub use trust::{
    CredentialProvider, Decrypter, PrivateKeySigner, PublicKeyTrustEngine, RequestSigner,
    SignedObject, TrustAnchor, TrustEngine,
};
