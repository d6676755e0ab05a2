// src/tools/definitions.rs
// Tool schemas declared to the model

use serde_json::json;

use crate::llm::Tool;

fn tool(name: &str, description: &str, input_schema: serde_json::Value) -> Tool {
    Tool {
        name: name.into(),
        description: description.into(),
        input_schema,
        cache_control: None,
    }
}

/// All repository tools, in declaration order
pub fn get_tools() -> Vec<Tool> {
    vec![
        tool(
            "read_file",
            "Read a file from the repository. Very large files are truncated; the result reports the original length.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Repository-relative file path, e.g. src/utils.ts"
                    }
                },
                "required": ["path"]
            }),
        ),
        tool(
            "search_files",
            "Find files whose path contains the query (case-insensitive).",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Substring of the file name or path"
                    }
                },
                "required": ["query"]
            }),
        ),
        tool(
            "grep_search",
            "Search file contents for a literal string (case-insensitive). Returns path, line number, and the matching line.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Text to search for"
                    },
                    "extensions": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Only search files with these extensions, e.g. [\"ts\", \"tsx\"]"
                    }
                },
                "required": ["query"]
            }),
        ),
        tool(
            "str_replace",
            "Replace an exact snippet in a file and commit the change. old_str must occur exactly once; include enough surrounding context to make it unique.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Repository-relative file path"
                    },
                    "old_str": {
                        "type": "string",
                        "description": "Exact text to replace, including whitespace"
                    },
                    "new_str": {
                        "type": "string",
                        "description": "Replacement text"
                    }
                },
                "required": ["path", "old_str", "new_str"]
            }),
        ),
        tool(
            "create_file",
            "Create a new file with the given content and commit it.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Repository-relative path of the new file"
                    },
                    "content": {
                        "type": "string",
                        "description": "Full file content"
                    }
                },
                "required": ["path", "content"]
            }),
        ),
        tool(
            "verify_edit",
            "Re-read a file from the repository (bypassing any cache) and check that it contains the expected snippet.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Repository-relative file path"
                    },
                    "expected_snippet": {
                        "type": "string",
                        "description": "Text the file should now contain"
                    }
                },
                "required": ["path", "expected_snippet"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names() {
        let names: Vec<String> = get_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            [
                "read_file",
                "search_files",
                "grep_search",
                "str_replace",
                "create_file",
                "verify_edit"
            ]
        );
    }

    #[test]
    fn test_schemas_are_strict_objects() {
        for tool in get_tools() {
            let schema = &tool.input_schema;
            assert_eq!(schema["type"], "object", "{}", tool.name);
            let required = schema["required"].as_array().unwrap();
            assert!(!required.is_empty(), "{} has no required params", tool.name);
            for param in required {
                let param = param.as_str().unwrap();
                assert!(
                    schema["properties"].get(param).is_some(),
                    "{} requires undeclared {}",
                    tool.name,
                    param
                );
            }
        }
    }
}
