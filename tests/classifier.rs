use authpipe::{ErrorClassifier, ErrorKind, TransportError};
use proptest::prelude::*;

fn any_transport_error() -> impl Strategy<Value = TransportError> {
    prop_oneof![
        ".*".prop_map(TransportError::Connectivity),
        Just(TransportError::Timeout),
        (100u16..600, ".*").prop_map(|(status, body)| TransportError::Status { status, body }),
        Just(TransportError::EmptyBody),
        ".*".prop_map(TransportError::Decode),
        ".*".prop_map(TransportError::Other),
    ]
}

proptest! {
    #[test]
    fn test_classify_is_total(err in any_transport_error()) {
        let kind = ErrorClassifier::default().classify(&err).kind();
        prop_assert!(matches!(
            kind,
            ErrorKind::NetworkUnavailable
                | ErrorKind::CredentialExpired
                | ErrorKind::EmptyResponse
                | ErrorKind::BadRequest
                | ErrorKind::Unknown
        ));
    }

    #[test]
    fn test_only_configured_statuses_expire(status in 100u16..600, body in ".{0,64}") {
        let classifier = ErrorClassifier::new(vec![401, 419]);
        let kind = classifier
            .classify(&TransportError::Status { status, body })
            .kind();
        prop_assert_eq!(kind == ErrorKind::CredentialExpired, status == 401 || status == 419);
    }

    #[test]
    fn test_classify_is_deterministic(err in any_transport_error()) {
        let classifier = ErrorClassifier::default();
        prop_assert_eq!(classifier.classify(&err), classifier.classify(&err));
    }
}

#[test]
fn test_representative_failures_map_to_documented_kinds() {
    let classifier = ErrorClassifier::default();
    let cases = [
        (TransportError::Timeout, ErrorKind::NetworkUnavailable),
        (
            TransportError::Status {
                status: 401,
                body: String::new(),
            },
            ErrorKind::CredentialExpired,
        ),
        (
            TransportError::Status {
                status: 400,
                body: "missing field".into(),
            },
            ErrorKind::BadRequest,
        ),
        (TransportError::EmptyBody, ErrorKind::EmptyResponse),
        (
            TransportError::Decode("expected value at line 1".into()),
            ErrorKind::Unknown,
        ),
    ];
    for (err, expected) in cases {
        assert_eq!(classifier.classify(&err).kind(), expected, "{err}");
    }
}
