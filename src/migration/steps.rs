use serde_json::{json, Map, Value};

/// v1 lines carry a flat `file_name` and no duration.
pub(super) fn history_v1_to_v2(value: Value) -> Result<Value, String> {
    let Value::Object(mut line) = value else {
        return Err("history line is not an object".into());
    };
    let audio = match line.remove("file_name") {
        Some(Value::String(name)) if !name.is_empty() => json!({ "file_name": name }),
        Some(Value::String(_)) | Some(Value::Null) | None => Value::Null,
        Some(_) => return Err("file_name is not a string".into()),
    };
    line.insert("audio".into(), audio);
    line.entry("duration_ms").or_insert(json!(0));
    Ok(Value::Object(line))
}

/// v1 was a bare list of words.
pub(super) fn dictionary_v1_to_v2(value: Value) -> Result<Value, String> {
    let Value::Array(words) = value else {
        return Err("dictionary is not a list".into());
    };
    let entries = words
        .into_iter()
        .map(|word| match word {
            Value::String(word) => Ok(json!({
                "input": word,
                "aliases": [],
                "replacement": word,
                "is_replacement": false,
            })),
            _ => Err("dictionary word is not a string".to_string()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "version": 2, "entries": entries }))
}

/// v1 was the flat settings object with `language` and a 0-100 volume.
pub(super) fn settings_v1_to_v2(value: Value) -> Result<Value, String> {
    let Value::Object(mut fields) = value else {
        return Err("settings is not an object".into());
    };
    if let Some(language) = fields.remove("language") {
        fields.insert("selected_language".into(), language);
    }
    if let Some(volume) = fields.get("audio_feedback_volume") {
        // Non-numeric values are left for the typed merge to reject.
        if let Some(percent) = volume.as_f64() {
            let scaled = (percent / 100.0).clamp(0.0, 1.0);
            fields.insert("audio_feedback_volume".into(), json!(scaled));
        }
    }
    let mut payload = Map::new();
    payload.insert("version".into(), json!(2));
    payload.insert("fields".into(), Value::Object(fields));
    Ok(Value::Object(payload))
}
