use bson::{Bson, Document};
use std::collections::HashMap;

/// Aggregate command options
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub allow_disk_use: bool,
    pub max_time_ms: Option<u64>,
    pub collation: Option<Document>,
    pub hint: Option<Document>,
    pub comment: Option<Bson>,
    pub let_vars: Document,
    pub bypass_document_validation: bool,
    pub read_concern: Option<Document>,
    pub write_concern: Option<Document>,
    pub explain: bool,
}

impl AggregateOptions {
    /// Parse options from aggregate command document
    pub fn from_command(cmd: &Document) -> Self {
        Self {
            allow_disk_use: cmd.get_bool("allowDiskUse").unwrap_or(false),
            max_time_ms: cmd.get_i64("maxTimeMS").ok().map(|v| v as u64),
            collation: cmd.get_document("collation").ok().cloned(),
            hint: cmd.get_document("hint").ok().cloned(),
            comment: cmd.get("comment").cloned(),
            let_vars: cmd.get_document("let").ok().cloned().unwrap_or_default(),
            bypass_document_validation: cmd.get_bool("bypassDocumentValidation").unwrap_or(false),
            read_concern: cmd.get_document("readConcern").ok().cloned(),
            write_concern: cmd.get_document("writeConcern").ok().cloned(),
            explain: cmd.contains_key("explain"),
        }
    }
}

/// Pipeline stage. Limited to the subset the in-memory engine executes; stages
/// that imply a second collection, disk writes or an external index (`$lookup`,
/// `$out`, `$geoNear`, ...) are deliberately not represented here.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Document),
    Project(Document),
    AddFields(Document),
    Set(Document),
    Unset(Vec<String>),
    ReplaceRoot { replacement: Bson },
    ReplaceWith(Bson),
    Sort(Document),
    Limit(i64),
    Skip(i64),
    Count(String),
    Group { id: Bson, accumulators: Document },
    Unwind {
        path: String,
        include_array_index: Option<String>,
        preserve_null_and_empty_arrays: bool,
    },
    Facet(HashMap<String, Vec<Stage>>),
    SortByCount(Bson),
}

/// Parsed pipeline
#[derive(Debug)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub options: AggregateOptions,
}

impl Pipeline {
    /// Parse pipeline from command document
    pub fn parse(cmd: &Document) -> anyhow::Result<Self> {
        let options = AggregateOptions::from_command(cmd);

        let pipeline_array = cmd
            .get_array("pipeline")
            .map_err(|_| anyhow::anyhow!("aggregate command requires pipeline array"))?;

        let mut stages = Vec::new();
        let mut has_facet = false;

        for (idx, stage_bson) in pipeline_array.iter().enumerate() {
            let stage_doc = stage_bson
                .as_document()
                .ok_or_else(|| anyhow::anyhow!("pipeline stage must be a document"))?;

            let stage = Self::parse_stage(stage_doc)?;

            match &stage {
                Stage::Facet(_) => {
                    if has_facet {
                        return Err(anyhow::anyhow!("only one $facet stage allowed"));
                    }
                    if idx != pipeline_array.len() - 1 {
                        return Err(anyhow::anyhow!("$facet must be the last stage"));
                    }
                    has_facet = true;
                }
                Stage::Match(filter) => {
                    Self::validate_match_filter(filter, idx == 0)?;
                }
                _ => {}
            }

            stages.push(stage);
        }

        Ok(Self { stages, options })
    }

    /// Parse a single stage document
    fn parse_stage(doc: &Document) -> anyhow::Result<Stage> {
        if doc.is_empty() {
            return Err(anyhow::anyhow!("empty pipeline stage"));
        }

        let (stage_name, stage_value) = doc.iter().next().unwrap();

        match stage_name.as_str() {
            "$match" => {
                let filter = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$match value must be a document"))?
                    .clone();
                Ok(Stage::Match(filter))
            }
            "$project" => {
                let spec = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$project value must be a document"))?
                    .clone();
                Ok(Stage::Project(spec))
            }
            "$addFields" => {
                let spec = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$addFields value must be a document"))?
                    .clone();
                Ok(Stage::AddFields(spec))
            }
            "$set" => {
                let spec = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$set value must be a document"))?
                    .clone();
                Ok(Stage::Set(spec))
            }
            "$unset" => {
                let fields: Vec<String> = if let Some(arr) = stage_value.as_array() {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                } else if let Some(s) = stage_value.as_str() {
                    vec![s.to_string()]
                } else {
                    return Err(anyhow::anyhow!("$unset value must be string or array"));
                };
                Ok(Stage::Unset(fields))
            }
            "$replaceRoot" => {
                let doc = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$replaceRoot value must be a document"))?;
                let replacement = doc
                    .get("newRoot")
                    .ok_or_else(|| anyhow::anyhow!("$replaceRoot requires newRoot"))?
                    .clone();
                Ok(Stage::ReplaceRoot { replacement })
            }
            "$replaceWith" => Ok(Stage::ReplaceWith(stage_value.clone())),
            "$sort" => {
                let spec = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$sort value must be a document"))?
                    .clone();
                Ok(Stage::Sort(spec))
            }
            "$limit" => {
                let n = parse_stage_int(stage_value, "$limit")?;
                if n < 0 {
                    return Err(anyhow::anyhow!("$limit value must be non-negative"));
                }
                Ok(Stage::Limit(n))
            }
            "$skip" => {
                let n = parse_stage_int(stage_value, "$skip")?;
                if n < 0 {
                    return Err(anyhow::anyhow!("$skip value must be non-negative"));
                }
                Ok(Stage::Skip(n))
            }
            "$count" => {
                let field = stage_value
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("$count value must be a string"))?
                    .to_string();
                if field.is_empty()
                    || field.starts_with('$')
                    || field.contains('.')
                    || field.contains('\0')
                {
                    return Err(anyhow::anyhow!(
                        "$count field name must be non-empty, not start with $, not contain . or null"
                    ));
                }
                Ok(Stage::Count(field))
            }
            "$group" => {
                let doc = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$group value must be a document"))?;
                let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
                let mut accumulators = Document::new();
                for (k, v) in doc.iter() {
                    if k != "_id" {
                        accumulators.insert(k.clone(), v.clone());
                    }
                }
                Ok(Stage::Group { id, accumulators })
            }
            "$unwind" => {
                if let Some(path) = stage_value.as_str() {
                    Ok(Stage::Unwind {
                        path: path.to_string(),
                        include_array_index: None,
                        preserve_null_and_empty_arrays: false,
                    })
                } else if let Some(doc) = stage_value.as_document() {
                    let path = doc
                        .get_str("path")
                        .map_err(|_| anyhow::anyhow!("$unwind requires path"))?
                        .to_string();
                    let include_array_index =
                        doc.get_str("includeArrayIndex").ok().map(|s| s.to_string());
                    let preserve_null_and_empty_arrays =
                        doc.get_bool("preserveNullAndEmptyArrays").unwrap_or(false);
                    Ok(Stage::Unwind {
                        path,
                        include_array_index,
                        preserve_null_and_empty_arrays,
                    })
                } else {
                    Err(anyhow::anyhow!("$unwind value must be string or document"))
                }
            }
            "$facet" => {
                let doc = stage_value
                    .as_document()
                    .ok_or_else(|| anyhow::anyhow!("$facet value must be a document"))?;

                let mut facets = HashMap::new();
                for (name, pipeline_bson) in doc.iter() {
                    let pipeline_array = pipeline_bson
                        .as_array()
                        .ok_or_else(|| anyhow::anyhow!("$facet pipeline must be an array"))?;

                    let mut sub_stages = Vec::new();
                    for stage_bson in pipeline_array {
                        let stage_doc = stage_bson
                            .as_document()
                            .ok_or_else(|| anyhow::anyhow!("pipeline stage must be a document"))?;
                        let stage = Self::parse_stage(stage_doc)?;
                        if matches!(stage, Stage::Facet(_)) {
                            return Err(anyhow::anyhow!("$facet may not nest $facet"));
                        }
                        sub_stages.push(stage);
                    }
                    facets.insert(name.clone(), sub_stages);
                }
                Ok(Stage::Facet(facets))
            }
            "$sortByCount" => Ok(Stage::SortByCount(stage_value.clone())),
            _ => Err(anyhow::anyhow!("Unsupported pipeline stage: {}", stage_name)),
        }
    }

    /// Validate $match filter restrictions
    fn validate_match_filter(filter: &Document, is_first_stage: bool) -> anyhow::Result<()> {
        if filter.contains_key("$where") {
            return Err(anyhow::anyhow!("$where is not allowed in $match"));
        }
        if filter.contains_key("$near") || filter.contains_key("$nearSphere") {
            return Err(anyhow::anyhow!(
                "$near and $nearSphere are not allowed in $match, use $geoNear instead"
            ));
        }
        if filter.contains_key("$text") && !is_first_stage {
            return Err(anyhow::anyhow!(
                "$match with $text is only allowed as the first pipeline stage"
            ));
        }
        Ok(())
    }
}

fn parse_stage_int(val: &Bson, stage: &str) -> anyhow::Result<i64> {
    if let Some(n) = val.as_i64() {
        Ok(n)
    } else if let Some(n) = val.as_i32() {
        Ok(n as i64)
    } else {
        Err(anyhow::anyhow!("{} value must be an integer", stage))
    }
}
