//! Chat page and starter prompts.

use serde::Serialize;

/// An example prompt shown before a conversation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Starter {
    pub label: &'static str,
    pub message: &'static str,
}

pub const STARTERS: [Starter; 4] = [
    Starter {
        label: "💊 How many patients have Hypertension and are prescribed Lisinopril? (NL2SQL)",
        message: "How many patients have Hypertension and are prescribed Lisinopril?",
    },
    Starter {
        label: "❓ As of Feb 2025, new anticoagulant therapies from the FDA? (Google Search)",
        message: "Are there any recent updates in 2025 on new anticoagulant therapies from the FDA?",
    },
    Starter {
        label: "❤️ ACC guidelines for hypertension (AZURE AI SEARCH)",
        message: "What does the ACC recommend as first-line therapy for hypertension in elderly patients?",
    },
    Starter {
        label: "👵 Mega Query for 79-Year-Old Gloria Paul with hyperlipidemia (AGENTIC SEARCH)",
        message: "I have a 79-year-old patient named Gloria Paul with hyperlipidemia. \
                  She's on Atorvastatin. Can you confirm her medical details from the database, \
                  check the ACC guidelines for hyperlipidemia, and see if there are any new medication \
                  updates from the FDA as of Feb 2025? Then give me a summary.",
    },
];

/// Minimal escaping for text placed in HTML content and attributes.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn starter_buttons() -> String {
    STARTERS
        .iter()
        .map(|s| {
            format!(
                r#"<button type="button" class="starter" data-message="{}">{}</button>"#,
                escape_html(s.message),
                escape_html(s.label)
            )
        })
        .collect::<Vec<_>>()
        .join("\n            ")
}

/// The single-page chat UI.
pub fn index_page() -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Healthcare Assistant</title>
    <style>
        body {{ font-family: system-ui, sans-serif; margin: 0; background: #f5f7fa; color: #1f2933; }}
        main {{ max-width: 52rem; margin: 0 auto; padding: 1.5rem; display: flex; flex-direction: column; height: 100vh; box-sizing: border-box; }}
        #log {{ flex: 1; overflow-y: auto; }}
        .msg {{ white-space: pre-wrap; padding: .75rem 1rem; border-radius: .75rem; margin: .5rem 0; }}
        .user {{ background: #dbeafe; align-self: flex-end; }}
        .agent {{ background: #fff; box-shadow: 0 1px 2px rgba(0,0,0,.08); }}
        .error {{ background: #fee2e2; }}
        #starters {{ display: grid; grid-template-columns: 1fr 1fr; gap: .5rem; }}
        .starter {{ text-align: left; padding: .75rem; border-radius: .75rem; border: 1px solid #cbd2d9; background: #fff; cursor: pointer; }}
        form {{ display: flex; gap: .5rem; margin-top: 1rem; }}
        textarea {{ flex: 1; padding: .75rem; border-radius: .75rem; border: 1px solid #cbd2d9; resize: none; }}
    </style>
</head>
<body>
<main>
    <header><h1>Healthcare Assistant</h1></header>
    <section id="log">
        <div id="starters">
            {starters}
        </div>
    </section>
    <form id="chat">
        <textarea name="message" rows="2" placeholder="Ask about patients, guidelines or recent approvals..." required></textarea>
        <button type="submit">Send</button>
        <button type="button" id="clear">Clear history</button>
    </form>
</main>
<script>
    const userId = localStorage.getItem("user_id") || crypto.randomUUID();
    localStorage.setItem("user_id", userId);
    const log = document.getElementById("log");
    const form = document.getElementById("chat");

    function append(text, cls) {{
        const div = document.createElement("div");
        div.className = "msg " + cls;
        div.textContent = text;
        log.appendChild(div);
        log.scrollTop = log.scrollHeight;
    }}

    async function send(message) {{
        document.getElementById("starters")?.remove();
        append(message, "user");
        const resp = await fetch("/api/chat", {{
            method: "POST",
            headers: {{ "Content-Type": "application/json" }},
            body: JSON.stringify({{ user_id: userId, message }}),
        }});
        const body = await resp.json();
        append(body.reply, body.error ? "agent error" : "agent");
    }}

    form.addEventListener("submit", (e) => {{
        e.preventDefault();
        const text = form.message.value.trim();
        if (text) {{ form.reset(); send(text); }}
    }});
    form.message.addEventListener("keydown", (e) => {{
        if (e.key === "Enter" && !e.shiftKey) {{ e.preventDefault(); form.requestSubmit(); }}
    }});
    document.querySelectorAll(".starter").forEach((b) =>
        b.addEventListener("click", () => send(b.dataset.message)));
    document.getElementById("clear").addEventListener("click", async () => {{
        const resp = await fetch("/api/actions/clear_history", {{
            method: "POST",
            headers: {{ "Content-Type": "application/json" }},
            body: JSON.stringify({{ user_id: userId }}),
        }});
        const body = await resp.json();
        log.replaceChildren();
        append(body.reply, "agent");
    }});
</script>
</body>
</html>"#,
        starters = starter_buttons()
    )
}
