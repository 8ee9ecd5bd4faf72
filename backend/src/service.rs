use std::path::PathBuf;

use log::info;
use serde_json::{Map, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::inference::Regressor;
use crate::loader::{self, ModelInfo};

/// Resolved locations of the two startup artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    pub metadata: PathBuf,
}

/// A prediction together with the exact, ordered inputs that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub value: f64,
    pub features_used: Map<String, Value>,
}

/// Holds the immutable model and the feature order it was trained on.
pub struct PredictionService {
    model: Box<dyn Regressor>,
    features: Vec<String>,
}

impl PredictionService {
    /// Pairs a model with its feature list, checking that the two agree.
    pub fn new(model: Box<dyn Regressor>, features: Vec<String>) -> ServiceResult<Self> {
        if features.is_empty() {
            return Err(ServiceError::Configuration(
                "feature list must not be empty".to_string(),
            ));
        }
        if model.input_width() != features.len() {
            return Err(ServiceError::Configuration(format!(
                "model expects {} inputs but metadata lists {} features",
                model.input_width(),
                features.len()
            )));
        }
        if let Some(trained) = model.feature_names() {
            if trained != features.as_slice() {
                return Err(ServiceError::Configuration(format!(
                    "model was trained on {:?} but metadata lists {:?}",
                    trained, features
                )));
            }
        }
        Ok(Self { model, features })
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Validates `payload`, orders it by the feature list and runs the model.
    ///
    /// Keys outside the feature list are ignored.
    pub fn predict_one(&self, payload: &Map<String, Value>) -> ServiceResult<f64> {
        let row = self.build_row(payload)?;
        self.run(&row)
    }

    /// Like [`predict_one`](Self::predict_one), also echoing the inputs used.
    pub fn predict(&self, payload: &Map<String, Value>) -> ServiceResult<Prediction> {
        let row = self.build_row(payload)?;
        let value = self.run(&row)?;

        let features_used = self
            .features
            .iter()
            .zip(&row)
            .map(|(name, v)| (name.clone(), Value::from(*v)))
            .collect();

        Ok(Prediction {
            value,
            features_used,
        })
    }

    fn build_row(&self, payload: &Map<String, Value>) -> ServiceResult<Vec<f64>> {
        let missing: Vec<String> = self
            .features
            .iter()
            .filter(|f| !payload.contains_key(f.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ServiceError::Validation { missing });
        }

        let limit = self.model.input_limit();
        self.features
            .iter()
            .map(|f| coerce_feature(f, &payload[f.as_str()], limit))
            .collect()
    }

    fn run(&self, row: &[f64]) -> ServiceResult<f64> {
        let value = self.model.predict_row(row)?;
        if !value.is_finite() {
            return Err(ServiceError::Inference(format!(
                "model returned a non-finite prediction ({})",
                value
            )));
        }
        Ok(value)
    }
}

/// Numbers pass through, numeric strings are parsed and booleans become 1/0.
/// The result must be finite and within what the model can represent.
fn coerce_feature(name: &str, value: &Value, limit: f64) -> ServiceResult<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() && v.abs() <= limit => Ok(v),
        _ => Err(ServiceError::Type {
            feature: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Reads the metadata, extracts the `model2` feature list and loads the model.
pub fn build_service(paths: &ArtifactPaths) -> ServiceResult<PredictionService> {
    let record = loader::load_metadata(&paths.metadata)?;
    let info = ModelInfo::from_record(&record)?;
    let model = loader::load_model(&paths.model, info.model2_features.len())?;
    let service = PredictionService::new(model, info.model2_features)?;

    info!(
        "Prediction service ready with {} features: {}",
        service.features.len(),
        service.features.join(", ")
    );
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::write_linear_onnx;
    use crate::inference::LinearRegressor;
    use proptest::prelude::*;
    use serde_json::json;
    use std::fs;

    const CALIFORNIA: [&str; 8] = [
        "MedInc",
        "HouseAge",
        "AveRooms",
        "AveBedrms",
        "Population",
        "AveOccup",
        "Latitude",
        "Longitude",
    ];

    fn features() -> Vec<String> {
        CALIFORNIA.iter().map(|s| s.to_string()).collect()
    }

    fn service() -> PredictionService {
        let model = LinearRegressor::new(
            vec![0.44, 0.0097, -0.107, 0.645, -0.000004, -0.0038, -0.42, -0.434],
            -37.02,
        );
        PredictionService::new(Box::new(model), features()).expect("service")
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    fn sample() -> Map<String, Value> {
        payload(json!({
            "MedInc": 8.3, "HouseAge": 41, "AveRooms": 6.98, "AveBedrms": 1.02,
            "Population": 322, "AveOccup": 2.55, "Latitude": 37.88, "Longitude": -122.23
        }))
    }

    #[test]
    fn predicts_finite_value_for_complete_payload() {
        let y = service().predict_one(&sample()).expect("predict");
        assert!(y.is_finite());
    }

    #[test]
    fn prediction_matches_linear_combination() {
        let model = LinearRegressor::new(vec![1.0, 10.0], 0.5);
        let service = PredictionService::new(
            Box::new(model),
            vec!["a".to_string(), "b".to_string()],
        )
        .unwrap();
        // Payload key order is irrelevant; the feature list decides column order.
        let y = service
            .predict_one(&payload(json!({"b": 2.0, "a": 3.0})))
            .unwrap();
        assert!((y - 23.5).abs() < 1e-12);
    }

    #[test]
    fn echoes_the_eight_features_in_order() {
        let prediction = service().predict(&sample()).expect("predict");
        let keys: Vec<&str> = prediction.features_used.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, CALIFORNIA);
        assert_eq!(prediction.features_used["MedInc"], json!(8.3));
        assert_eq!(prediction.features_used["HouseAge"], json!(41.0));
        assert_eq!(prediction.features_used["Longitude"], json!(-122.23));
        assert_eq!(prediction.value, service().predict_one(&sample()).unwrap());
    }

    #[test]
    fn reports_exactly_the_missing_features_in_list_order() {
        let mut p = sample();
        p.remove("Latitude");
        p.remove("HouseAge");
        match service().predict_one(&p) {
            Err(ServiceError::Validation { missing }) => {
                assert_eq!(missing, vec!["HouseAge", "Latitude"]);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn empty_payload_is_missing_everything() {
        match service().predict_one(&Map::new()) {
            Err(ServiceError::Validation { missing }) => assert_eq!(missing, features()),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn non_numeric_values_are_type_errors() {
        for bad in [json!("abc"), json!(null), json!({}), json!([1.0]), json!("inf")] {
            let mut p = sample();
            p.insert("AveRooms".to_string(), bad.clone());
            match service().predict_one(&p) {
                Err(ServiceError::Type { feature, .. }) => assert_eq!(feature, "AveRooms"),
                other => panic!("expected type error for {}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let mut p = sample();
        p.insert("MedInc".to_string(), json!("8.3"));
        assert_eq!(
            service().predict_one(&p).unwrap(),
            service().predict_one(&sample()).unwrap()
        );
    }

    #[test]
    fn booleans_are_coerced_to_one_and_zero() {
        let model = LinearRegressor::new(vec![2.0, 3.0], 0.0);
        let service =
            PredictionService::new(Box::new(model), vec!["a".into(), "b".into()]).unwrap();
        let prediction = service
            .predict(&payload(json!({"a": true, "b": false})))
            .unwrap();
        assert_eq!(prediction.value, 2.0);
        assert_eq!(prediction.features_used["a"], json!(1.0));
        assert_eq!(prediction.features_used["b"], json!(0.0));
    }

    #[test]
    fn values_beyond_float32_range_are_type_errors_for_onnx_models() {
        let file = write_linear_onnx(&[1.0, 1.0], 0.0, 2);
        let model = crate::loader::load_model(file.path(), 2).expect("load");
        let service = PredictionService::new(model, vec!["a".into(), "b".into()]).unwrap();

        match service.predict_one(&payload(json!({"a": 1.0, "b": 1e39}))) {
            Err(ServiceError::Type { feature, .. }) => assert_eq!(feature, "b"),
            other => panic!("expected type error, got {:?}", other),
        }
        let y = service
            .predict_one(&payload(json!({"a": 1.0, "b": 2.0})))
            .unwrap();
        assert!((y - 3.0).abs() < 1e-5);
    }

    #[test]
    fn coefficient_models_accept_the_full_f64_range() {
        let model = LinearRegressor::new(vec![1e-300], 0.0);
        let service = PredictionService::new(Box::new(model), vec!["a".into()]).unwrap();
        let y = service.predict_one(&payload(json!({"a": 1e300}))).unwrap();
        assert!((y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn extra_keys_do_not_change_the_output() {
        let baseline = service().predict_one(&sample()).unwrap();
        let mut p = sample();
        p.insert("unused_key".to_string(), json!("anything"));
        p.insert("ocean_proximity".to_string(), json!({"nested": [1, 2]}));
        assert_eq!(service().predict_one(&p).unwrap(), baseline);
    }

    #[test]
    fn rejects_width_mismatch() {
        let model = LinearRegressor::new(vec![1.0, 2.0, 3.0], 0.0);
        let err = PredictionService::new(Box::new(model), features()).err().unwrap();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }

    #[test]
    fn rejects_fingerprint_in_different_order() {
        let mut trained = features();
        trained.swap(6, 7);
        let model = LinearRegressor::new(vec![0.0; 8], 0.0).with_feature_names(trained);
        let err = PredictionService::new(Box::new(model), features()).err().unwrap();
        assert!(err.to_string().contains("trained on"));
    }

    #[test]
    fn accepts_matching_fingerprint() {
        let model = LinearRegressor::new(vec![0.0; 8], 1.5).with_feature_names(features());
        let service = PredictionService::new(Box::new(model), features()).unwrap();
        assert_eq!(service.predict_one(&sample()).unwrap(), 1.5);
    }

    #[test]
    fn non_finite_model_output_is_an_inference_error() {
        let model = LinearRegressor::new(vec![f64::MAX, f64::MAX], 0.0);
        let service =
            PredictionService::new(Box::new(model), vec!["a".into(), "b".into()]).unwrap();
        let err = service
            .predict_one(&payload(json!({"a": 1e300, "b": 1e300})))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Inference(_)));
    }

    #[test]
    fn build_service_wires_metadata_and_model() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let metadata = dir.path().join("model_info.json");
        let model = dir.path().join("model.json");
        fs::write(
            &metadata,
            json!({"model2_features": ["MedInc", "HouseAge"], "model2_r2": 0.5}).to_string(),
        )
        .unwrap();
        fs::write(
            &model,
            r#"{"format_version":1,"coefficients":[2.0,0.1],"intercept":1.0,
                "feature_names":["MedInc","HouseAge"]}"#,
        )
        .unwrap();

        let service = build_service(&ArtifactPaths { model, metadata }).expect("build");
        assert_eq!(service.features(), ["MedInc", "HouseAge"]);
        let y = service
            .predict_one(&payload(json!({"MedInc": 3.0, "HouseAge": 10.0})))
            .unwrap();
        assert!((y - 8.0).abs() < 1e-12);
    }

    #[test]
    fn build_service_runs_an_onnx_artifact_end_to_end() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let metadata = dir.path().join("model_info.json");
        fs::write(
            &metadata,
            json!({"model2_features": CALIFORNIA, "model2_r2": 0.6}).to_string(),
        )
        .unwrap();
        let weights = [0.44f32, 0.0097, -0.107, 0.645, -0.000004, -0.0038, -0.42, -0.434];
        let file = write_linear_onnx(&weights, -37.02, 8);

        let paths = ArtifactPaths {
            model: file.path().to_path_buf(),
            metadata,
        };
        let onnx = build_service(&paths).expect("build");
        let prediction = onnx.predict(&sample()).expect("predict");

        let expected = service().predict_one(&sample()).unwrap();
        assert!(
            (prediction.value - expected).abs() < 1e-3,
            "onnx {} vs coefficients {}",
            prediction.value,
            expected
        );
        assert_eq!(prediction.features_used.len(), 8);
    }

    #[test]
    fn build_service_fails_on_invalid_feature_list() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let metadata = dir.path().join("model_info.json");
        let model = dir.path().join("model.json");
        fs::write(&metadata, r#"{"model2_features": ["MedInc", 7]}"#).unwrap();
        fs::write(&model, r#"{"format_version":1,"coefficients":[1.0,1.0],"intercept":0.0}"#)
            .unwrap();

        let err = build_service(&ArtifactPaths { model, metadata }).err().unwrap();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }

    #[test]
    fn build_service_fails_when_model_is_absent() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let metadata = dir.path().join("model_info.json");
        fs::write(&metadata, r#"{"model2_features": ["MedInc"]}"#).unwrap();

        let paths = ArtifactPaths {
            model: dir.path().join("model2_linear_regression.onnx"),
            metadata,
        };
        assert!(matches!(
            build_service(&paths),
            Err(ServiceError::Artifact { .. })
        ));
    }

    fn payload_from(values: &[f64]) -> Map<String, Value> {
        CALIFORNIA
            .iter()
            .zip(values)
            .map(|(name, v)| (name.to_string(), json!(v)))
            .collect()
    }

    fn arb_extra_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<f64>().prop_map(Value::from),
            ".{0,16}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            Just(Value::Null),
            prop::collection::vec(any::<i32>(), 0..4).prop_map(Value::from),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn complete_payloads_always_predict_finite_values(
            values in prop::collection::vec(-1.0e9f64..1.0e9, 8)
        ) {
            let y = service().predict_one(&payload_from(&values));
            prop_assert!(matches!(y, Ok(v) if v.is_finite()), "got {:?}", y);
        }

        #[test]
        fn missing_list_matches_removed_features_in_order(
            values in prop::collection::vec(-1.0e3f64..1.0e3, 8),
            removed in prop::collection::vec(any::<bool>(), 8)
        ) {
            prop_assume!(removed.iter().any(|r| *r));

            let mut p = payload_from(&values);
            let mut expected = Vec::new();
            for (name, gone) in CALIFORNIA.iter().zip(&removed) {
                if *gone {
                    p.remove(*name);
                    expected.push(name.to_string());
                }
            }

            match service().predict_one(&p) {
                Err(ServiceError::Validation { missing }) => prop_assert_eq!(missing, expected),
                other => prop_assert!(false, "expected validation error, got {:?}", other),
            }
        }

        #[test]
        fn non_numeric_strings_are_type_errors(
            values in prop::collection::vec(-1.0e3f64..1.0e3, 8),
            index in 0usize..8,
            text in "[a-zA-Z_ ]{0,12}"
        ) {
            let mut p = payload_from(&values);
            p.insert(CALIFORNIA[index].to_string(), Value::from(text));

            match service().predict_one(&p) {
                Err(ServiceError::Type { feature, .. }) => prop_assert_eq!(feature, CALIFORNIA[index]),
                other => prop_assert!(false, "expected type error, got {:?}", other),
            }
        }

        #[test]
        fn extra_keys_never_change_the_prediction(
            values in prop::collection::vec(-1.0e6f64..1.0e6, 8),
            extra in prop::collection::hash_map("[a-z_][a-z0-9_]{0,15}", arb_extra_value(), 0..6)
        ) {
            let base = payload_from(&values);
            let mut extended = base.clone();
            // Lowercase keys never collide with the feature names.
            extended.extend(extra);

            let svc = service();
            prop_assert_eq!(svc.predict(&base).unwrap(), svc.predict(&extended).unwrap());
        }
    }
}
