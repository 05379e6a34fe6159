pub mod types;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::ExceptionType;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn test_error_display_messages() {
        let err = AppError::Config("Port out of range".to_string());
        assert_eq!(err.to_string(), "Configuration error: Port out of range");

        let err = AppError::InvalidInput("name required".to_string());
        assert_eq!(err.to_string(), "Invalid input: name required");

        let err = AppError::NotFound("item 7".to_string());
        assert_eq!(err.to_string(), "Not found: item 7");
    }

    #[test]
    fn test_error_to_response_conversion() {
        let response = AppError::InvalidInput("test".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::NotFound("test".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = AppError::Server("bind failed".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = AppError::Config("test".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let internal = anyhow::anyhow!("Connection to 192.168.1.100:5432 failed");
        let response = AppError::Internal(internal).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Internal error");
    }

    #[test]
    fn test_exception_type_is_variant_name() {
        assert_eq!(AppError::InvalidInput("x".into()).exception_type(), "InvalidInput");
        assert_eq!(AppError::Server("x".into()).exception_type(), "Server");
        assert_eq!(AppError::Internal(anyhow::anyhow!("x")).exception_type(), "Internal");
    }
}
