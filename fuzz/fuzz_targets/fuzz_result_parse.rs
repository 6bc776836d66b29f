#![no_main]

use libfuzzer_sys::fuzz_target;

use babycare_predict::inference::InferenceResponse;
use babycare_predict::result::{parse, PredictionResult, ResultShape};

/// Feeds arbitrary endpoint replies through both result shapes.
///
/// Parsing must never panic, and an accepted reply must serialize back to
/// JSON equal to its `to_value()` view.
fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    let reply = InferenceResponse::new(body);

    for shape in [ResultShape::Classes, ResultShape::Ranked] {
        let Ok(result) = parse(&reply, shape) else {
            continue;
        };
        assert_eq!(result.shape(), shape);

        if let PredictionResult::Classes(scores) = &result {
            assert_eq!(scores.labels.len(), scores.probabilities.len());
        }

        let encoded = result
            .to_json_string()
            .expect("accepted result must serialize");
        let reparsed: serde_json::Value =
            serde_json::from_str(&encoded).expect("serialized result must be valid JSON");
        assert_eq!(reparsed, result.to_value());
    }
});
