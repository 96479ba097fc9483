//! Page-side JavaScript evaluated through `Runtime.evaluate`.

/// Summary of the interactive parts of the page with center coordinates.
/// Password values are masked.
pub const PAGE_STATE: &str = r#"
(function() {
    function center(el) {
        const r = el.getBoundingClientRect();
        return { x: Math.round(r.x + r.width / 2), y: Math.round(r.y + r.height / 2) };
    }

    function labelFor(el) {
        if (el.id) {
            const label = document.querySelector('label[for="' + el.id + '"]');
            if (label) return label.textContent.trim();
        }
        const parent = el.closest('label');
        if (parent) return parent.textContent.trim();
        if (el.getAttribute('aria-label')) return el.getAttribute('aria-label');
        if (el.placeholder) return el.placeholder;
        return '';
    }

    const focused = document.activeElement;
    const focusedInfo = focused && focused !== document.body
        ? focused.tagName + (focused.id ? '#' + focused.id : '') + (focused.name ? '[name=' + focused.name + ']' : '')
        : '';

    const inputs = [];
    document.querySelectorAll('input, textarea').forEach(function(el) {
        if (el.offsetParent === null) return;
        const c = center(el);
        inputs.push({
            type: el.type || el.tagName.toLowerCase(),
            name: el.name || '',
            id: el.id || '',
            placeholder: el.placeholder || '',
            value: el.type === 'password' ? (el.value ? '***' : '') : (el.value || ''),
            label: labelFor(el),
            focused: el === focused,
            x: c.x,
            y: c.y
        });
    });

    const selects = [];
    document.querySelectorAll('select').forEach(function(el) {
        if (el.offsetParent === null) return;
        const c = center(el);
        const options = Array.from(el.options).map(function(opt) {
            return { value: opt.value, text: opt.text, selected: opt.selected };
        });
        const chosen = el.options[el.selectedIndex];
        selects.push({
            name: el.name || '',
            id: el.id || '',
            label: labelFor(el),
            selected_value: chosen ? chosen.value : '',
            selected_text: chosen ? chosen.text : '',
            options: options,
            x: c.x,
            y: c.y
        });
    });

    const buttons = [];
    document.querySelectorAll('button, input[type="submit"], input[type="button"], [role="button"]').forEach(function(el) {
        if (el.offsetParent === null) return;
        const c = center(el);
        buttons.push({ text: el.textContent.trim() || el.value || '', type: el.type || '', x: c.x, y: c.y });
    });

    const links = [];
    const anchors = document.querySelectorAll('a[href]');
    for (let i = 0; i < anchors.length && links.length < 20; i++) {
        const el = anchors[i];
        if (el.offsetParent === null) continue;
        const text = el.textContent.trim();
        if (!text) continue;
        const c = center(el);
        links.push({ text: text.substring(0, 50), href: el.getAttribute('href'), x: c.x, y: c.y });
    }

    return {
        url: location.href,
        title: document.title,
        focused_element: focusedInfo,
        inputs: inputs,
        selects: selects,
        buttons: buttons,
        links: links,
        text: document.body ? document.body.innerText.substring(0, 1000) : ''
    };
})()
"#;

pub const DOM_SNAPSHOT: &str = r#"
({
    url: location.href,
    title: document.title,
    html: document.documentElement ? document.documentElement.outerHTML : ''
})
"#;

pub const LOCATION: &str = "location.href";

pub const SELECT_ALL: &str = r#"
(function() {
    const el = document.activeElement;
    if (el && (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA')) {
        el.select();
        return 'selected';
    }
    if (el && el.isContentEditable) {
        document.execCommand('selectAll');
        return 'selected';
    }
    return 'no input focused';
})()
"#;

/// Expression locating the center of the first element matching `selector`
/// after scrolling it into view, or `null`.
pub fn element_center(selector: &str) -> String {
    let quoted = serde_json::Value::String(selector.to_string()).to_string();
    format!(
        r#"(function() {{
    const el = document.querySelector({});
    if (!el) return null;
    el.scrollIntoView({{ block: 'center', inline: 'center' }});
    const r = el.getBoundingClientRect();
    if (r.width === 0 && r.height === 0) return null;
    return {{ x: r.x + r.width / 2, y: r.y + r.height / 2 }};
}})()"#,
        quoted
    )
}

/// Expression focusing and clearing the first element matching `selector`.
pub fn focus_and_clear(selector: &str) -> String {
    let quoted = serde_json::Value::String(selector.to_string()).to_string();
    format!(
        r#"(function() {{
    const el = document.querySelector({});
    if (!el) return false;
    el.focus();
    if ('value' in el) {{
        el.value = '';
        el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    }}
    return true;
}})()"#,
        quoted
    )
}

pub fn scroll_by(delta_y: i64) -> String {
    format!("window.scrollBy(0, {})", delta_y)
}
