use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::error::{CoreError, ErrorKind};

pub type ApiResult<T> = Result<T, CoreError>;

/// Success envelope. Object payloads get `"success": true` merged in.
pub fn ok(result: impl Serialize) -> Json<Value> {
    let value = serde_json::to_value(result).unwrap_or(Value::Null);
    Json(match value {
        Value::Object(mut map) => {
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "success": true, "result": other }),
    })
}

pub fn err(code: &str, localized: &str, details: Option<Value>) -> Value {
    let mut body = json!({
        "success": false,
        "error": code,
        "message": code,
        "localized_message": localized,
    });
    if let Some(d) = details {
        body["details"] = d;
    }
    body
}

pub fn bad_body(rejection: JsonRejection) -> CoreError {
    CoreError::validation("body", rejection.body_text())
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Precondition => StatusCode::CONFLICT,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn localized(e: &CoreError) -> &'static str {
    match e {
        CoreError::Validation { .. } => "البيانات المدخلة غير صحيحة",
        CoreError::NotFound { .. } => "العنصر المطلوب غير موجود",
        CoreError::SectionNotFound(_) => "الشعبة غير موجودة",
        CoreError::DuplicateStudent { .. } => "الطالب مسجل مسبقاً في هذه الشعبة",
        CoreError::StudentNotInRoster { .. } => "لم يتم العثور على اسمك في قائمة طلاب الشعبة",
        CoreError::AmbiguousRoster { .. } => "يوجد أكثر من طالب بنفس الاسم، يرجى مراجعة المعلم",
        CoreError::JoinConflict { .. } => "هذا الطالب مرتبط بحساب تيليجرام آخر",
        CoreError::GroupNotReady { .. } => "مجموعة الشعبة غير جاهزة بعد، حاول لاحقاً",
        CoreError::LeaseHeld { .. } => "الخدمة مشغولة حالياً، حاول لاحقاً",
        CoreError::Forbidden(_) => "غير مصرح لك بهذا الإجراء",
        other => match other.kind() {
            ErrorKind::Transient => "الخدمة غير متاحة مؤقتاً، حاول لاحقاً",
            _ => "حدث خطأ غير متوقع",
        },
    }
}

fn details(e: &CoreError) -> Option<Value> {
    Some(match e {
        CoreError::Validation { field, reason } => json!({ "field": field, "reason": reason }),
        CoreError::NotFound { entity, id } => json!({ "entity": entity, "id": id }),
        CoreError::SectionNotFound(id) => json!({ "entity": "section", "id": id.to_string() }),
        CoreError::DuplicateStudent {
            section_id,
            normalized_name,
        } => json!({ "section_id": section_id, "normalized_name": normalized_name }),
        CoreError::StudentNotInRoster {
            section_id,
            suggestions,
        } => json!({ "section_id": section_id, "suggestions": suggestions }),
        CoreError::AmbiguousRoster { section_id, count } => {
            json!({ "section_id": section_id, "count": count })
        }
        CoreError::JoinConflict { student_id } => json!({ "student_id": student_id }),
        CoreError::GroupNotReady { section_id, status } => {
            json!({ "section_id": section_id, "status": status })
        }
        _ => return None,
    })
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        match kind {
            ErrorKind::Fatal => error!(error = %self, "request failed"),
            ErrorKind::Transient => tracing::warn!(error = %self, "request failed transiently"),
            _ => tracing::debug!(error = %self, code = self.code(), "request rejected"),
        }
        let body = err(self.code(), localized(&self), details(&self));
        (status_for(kind), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_merges_success_into_objects() {
        let Json(v) = ok(json!({ "status": "pending" }));
        assert_eq!(v["success"], true);
        assert_eq!(v["status"], "pending");
    }

    #[test]
    fn join_failures_carry_the_code_as_message() {
        let resp = CoreError::GroupNotReady {
            section_id: 3,
            status: "bot_added".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = err("GroupNotReady", "x", None);
        assert_eq!(body["message"], "GroupNotReady");
        assert_eq!(body["success"], false);
    }
}
