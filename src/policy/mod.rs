//! Access-restriction policies
//!
//! Resource policies are modelled as IAM JSON documents so the same value can
//! be attached to AWS Secrets Manager or evaluated in-process by the memory
//! store.

mod document;
mod engine;

pub use document::{
    evaluate_all, wildcard_match, Conditions, Decision, Effect, PolicyDocument, Principal, Request,
    Statement, ASSUME_ROLE_WITH_WEB_IDENTITY, FOR_ALL_VALUES_STRING_NOT_EQUALS, GET_SECRET_VALUE,
    POLICY_VERSION, PRINCIPAL_ARN_KEY, ROTATE_SECRET, STRING_EQUALS, STRING_LIKE,
    STRING_NOT_EQUALS,
};
pub use engine::{allow_actions, allow_read, deny_all_except, PolicyHazard, RestrictionPolicy};
