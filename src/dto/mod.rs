//! Request payloads accepted by the API, each paired with its validation schema.
//!
//! Handlers validate with [`Context::validated_json`](crate::context::Context::validated_json):
//!
//! ```rust,no_run
//! use earngate::{Response, StatusCode, context::Context, dto::SubmitProof};
//!
//! async fn submit(ctx: Context) -> Response {
//!     match ctx.validated_json::<SubmitProof>(&SubmitProof::schema()) {
//!         Ok(proof) => Response::json(StatusCode::Created, &proof),
//!         Err(errors) => errors.into_response(ctx.request().path()),
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::validation::{Constraint, Schema};

fn optional_notes() -> [Constraint; 3] {
    [
        Constraint::Optional,
        Constraint::IsString,
        Constraint::MaxLength(1000),
    ]
}

/// Proof of quest completion uploaded by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitProof {
    pub user_id: String,
    pub quest_id: String,
    pub file_name: String,
    /// Base64 content or a storage path.
    pub file_content: String,
}

impl SubmitProof {
    pub fn schema() -> Schema {
        Schema::new()
            .field("userId", [Constraint::IsUuid, Constraint::NotEmpty])
            .field("questId", [Constraint::IsUuid, Constraint::NotEmpty])
            .field(
                "fileName",
                [
                    Constraint::IsString,
                    Constraint::NotEmpty,
                    Constraint::MinLength(1),
                    Constraint::MaxLength(255),
                ],
            )
            .field("fileContent", [Constraint::IsString, Constraint::NotEmpty])
            .forbid_unknown()
    }
}

/// A verifier's rejection of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectSubmission {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RejectSubmission {
    pub fn schema() -> Schema {
        Schema::new()
            .field(
                "reason",
                [
                    Constraint::NotEmpty.with_message("Rejection reason is required"),
                    Constraint::IsString,
                    Constraint::MinLength(10)
                        .with_message("Rejection reason must be at least 10 characters"),
                    Constraint::MaxLength(500)
                        .with_message("Rejection reason cannot exceed 500 characters"),
                ],
            )
            .field("notes", optional_notes())
            .forbid_unknown()
    }
}

/// A verifier's approval of a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ApproveSubmission {
    pub fn schema() -> Schema {
        Schema::new().field("notes", optional_notes()).forbid_unknown()
    }
}

/// Wallet sign-in challenge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub stellar_address: String,
}

impl ChallengeRequest {
    pub fn schema() -> Schema {
        Schema::new()
            .field(
                "stellarAddress",
                [
                    Constraint::IsString,
                    Constraint::NotEmpty,
                    Constraint::IsStellarAddress
                        .with_message("Must be a valid Stellar public key address"),
                ],
            )
            .forbid_unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate;
    use serde_json::json;

    const UUID: &str = "123e4567-e89b-12d3-a456-426614174000";

    #[test]
    fn valid_proof_passes() {
        let body = json!({
            "userId": UUID,
            "questId": UUID,
            "fileName": "kyc_verification.pdf",
            "fileContent": "data:application/pdf;base64,JVBERi0xLjQK",
        });
        assert!(validate(&SubmitProof::schema(), &body).is_ok());
        let proof: SubmitProof = serde_json::from_value(body).unwrap();
        assert_eq!(proof.file_name, "kyc_verification.pdf");
    }

    #[test]
    fn extra_properties_are_rejected() {
        let body = json!({
            "userId": UUID,
            "questId": UUID,
            "fileName": "proof.png",
            "fileContent": "aGVsbG8=",
            "status": "APPROVED",
        });
        let err = validate(&SubmitProof::schema(), &body).unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(err.messages("status"), ["property status should not exist"]);

        let err = validate(&ApproveSubmission::schema(), &json!({ "approvedBy": "me" })).unwrap_err();
        assert_eq!(err.messages("approvedBy"), ["property approvedBy should not exist"]);
    }

    #[test]
    fn invalid_proof_lists_every_field() {
        let body = json!({ "userId": "nope", "fileName": "x".repeat(256) });
        let err = validate(&SubmitProof::schema(), &body).unwrap_err();
        assert_eq!(err.messages("userId"), ["userId must be a UUID"]);
        assert_eq!(
            err.messages("questId"),
            ["questId must be a UUID", "questId should not be empty"]
        );
        assert_eq!(
            err.messages("fileName"),
            ["fileName must be shorter than or equal to 255 characters"]
        );
        assert_eq!(err.messages("fileContent").len(), 2);
    }

    #[test]
    fn rejection_reason_bounds() {
        let err = validate(&RejectSubmission::schema(), &json!({ "reason": "too short" })).unwrap_err();
        assert_eq!(
            err.messages("reason"),
            ["Rejection reason must be at least 10 characters"]
        );

        let err = validate(&RejectSubmission::schema(), &json!({ "reason": "r".repeat(501) })).unwrap_err();
        assert_eq!(err.messages("reason"), ["Rejection reason cannot exceed 500 characters"]);

        let ok = json!({ "reason": "Screenshot does not show the completed task" });
        assert!(validate(&RejectSubmission::schema(), &ok).is_ok());
    }

    #[test]
    fn notes_are_optional_but_bounded() {
        assert!(validate(&ApproveSubmission::schema(), &json!({})).is_ok());
        let err = validate(&ApproveSubmission::schema(), &json!({ "notes": "n".repeat(1001) })).unwrap_err();
        assert_eq!(
            err.messages("notes"),
            ["notes must be shorter than or equal to 1000 characters"]
        );
    }

    #[test]
    fn challenge_requires_account_key() {
        let ok = json!({ "stellarAddress": "GAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAWHF" });
        assert!(validate(&ChallengeRequest::schema(), &ok).is_ok());
        let err = validate(&ChallengeRequest::schema(), &json!({ "stellarAddress": "GABC" })).unwrap_err();
        assert_eq!(err.messages("stellarAddress"), ["Must be a valid Stellar public key address"]);
    }
}
