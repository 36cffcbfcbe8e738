//! Dockerfile synthesis per archetype
//!
//! Every descriptor starts with a `source` stage that clones the repository,
//! so the build context only needs the Dockerfile itself. Output is a pure
//! function of the archetype and the repository URL.

use serde::Serialize;

use crate::detector::Archetype;

/// A generated build script and the port its image serves on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildDescriptor {
    pub archetype: Archetype,
    pub dockerfile: String,
    pub internal_port: u16,
}

/// Directories searched, in order, for an `index.html` in static sites
pub const STATIC_ENTRY_DIRS: [&str; 5] = [".", "public", "docs", "dist", "build"];

const NODE_IMAGE: &str = "node:18-alpine";
const PYTHON_IMAGE: &str = "python:3.11-slim";
const NGINX_IMAGE: &str = "nginx:alpine";
const GIT_IMAGE: &str = "alpine/git:latest";
const TOOLBOX_IMAGE: &str = "alpine:3.19";

const NPM_INSTALL: &str =
    "RUN if [ -f package-lock.json ]; then npm ci; else npm install; fi";
const NPM_INSTALL_PRODUCTION: &str =
    "RUN if [ -f package-lock.json ]; then npm ci --omit=dev; else npm install --omit=dev; fi";

pub fn synthesize(archetype: Archetype, repo_url: &str) -> BuildDescriptor {
    let body = match archetype {
        Archetype::Static => static_site(repo_url),
        Archetype::React => react(),
        Archetype::Nextjs => nextjs(),
        Archetype::NodeGeneric => node_generic(),
        Archetype::PythonGeneric => python_generic(),
    };

    let dockerfile = format!("{}\n{}", source_stage(repo_url), body);

    BuildDescriptor {
        archetype,
        dockerfile,
        internal_port: archetype.internal_port(),
    }
}

fn source_stage(repo_url: &str) -> String {
    format!(
        "# Fetch sources\n\
         FROM {GIT_IMAGE} AS source\n\
         RUN git clone --depth 1 {} /src && rm -rf /src/.git\n",
        shell_quote(repo_url)
    )
}

fn static_site(repo_url: &str) -> String {
    let heading = format!("<h1>Deployed from {}</h1>", html_escape(repo_url));
    let dirs = STATIC_ENTRY_DIRS.join(" ");

    format!(
        r#"# Locate the site root
FROM {TOOLBOX_IMAGE} AS site
COPY --from=source /src /src
RUN set -e; export LC_ALL=C; mkdir -p /site; entry=""; \
    for dir in {dirs}; do \
        if [ -f "/src/$dir/index.html" ]; then entry="/src/$dir"; break; fi; \
    done; \
    first=""; \
    if [ -z "$entry" ]; then \
        first="$(find /src -type f -name '*.html' | sort | head -n 1)"; \
        if [ -n "$first" ]; then entry="$(dirname "$first")"; fi; \
    fi; \
    if [ -n "$entry" ]; then \
        cp -R "$entry/." /site/; \
        if [ ! -f /site/index.html ]; then cp "$first" /site/index.html; fi; \
    else \
        cp -R /src/. /site/; \
        {{ \
            printf '%s\n' '<!DOCTYPE html>' '<html>' '<head><meta charset="utf-8"><title>Deployed site</title></head>' '<body>' {heading} '<ul>'; \
            find /src -type f \( -name '*.css' -o -name '*.js' \) | sort | sed 's|^/src/||' | \
                while read -r f; do printf '<li><a href="%s">%s</a></li>\n' "$f" "$f"; done; \
            printf '%s\n' '</ul>' '</body>' '</html>'; \
        }} > /site/index.html; \
    fi

# Serve
FROM {NGINX_IMAGE}
COPY --from=site /site /usr/share/nginx/html
EXPOSE 80
CMD ["nginx", "-g", "daemon off;"]
"#,
        heading = shell_quote(&heading),
    )
}

fn react() -> String {
    format!(
        r#"# Build stage
FROM {NODE_IMAGE} AS builder
WORKDIR /app
COPY --from=source /src ./
{NPM_INSTALL}
RUN npm run build
RUN mkdir -p /out && \
    if [ -d build ]; then cp -R build/. /out/; \
    elif [ -d dist ]; then cp -R dist/. /out/; \
    else echo "build produced neither build/ nor dist/" >&2; exit 1; fi

# Production stage
FROM {NODE_IMAGE}
WORKDIR /app
RUN npm install -g serve
COPY --from=builder /out ./site
EXPOSE 3000
CMD ["serve", "-s", "site", "-l", "3000"]
"#
    )
}

fn nextjs() -> String {
    format!(
        r#"# Build stage
FROM {NODE_IMAGE} AS builder
WORKDIR /app
COPY --from=source /src ./
{NPM_INSTALL}
RUN npm run build

# Production stage
FROM {NODE_IMAGE}
WORKDIR /app
ENV NODE_ENV=production
ENV PORT=3000
COPY --from=builder /app ./
EXPOSE 3000
CMD ["npm", "start"]
"#
    )
}

fn node_generic() -> String {
    format!(
        r#"FROM {NODE_IMAGE}
WORKDIR /app
COPY --from=source /src ./
{NPM_INSTALL_PRODUCTION}
ENV PORT=3000
EXPOSE 3000
CMD ["npm", "start"]
"#
    )
}

fn python_generic() -> String {
    format!(
        r#"FROM {PYTHON_IMAGE}
WORKDIR /app
COPY --from=source /src ./
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; \
    elif [ -f pyproject.toml ]; then pip install --no-cache-dir .; fi
ENV PORT=8000
EXPOSE 8000
CMD ["sh", "-c", "if [ -f app.py ]; then exec python app.py; else exec python main.py; fi"]
"#
    )
}

/// Quote a value for a POSIX shell command line
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: &str = "https://github.com/acme/site";
    const ALL: [Archetype; 5] = [
        Archetype::Static,
        Archetype::NodeGeneric,
        Archetype::React,
        Archetype::Nextjs,
        Archetype::PythonGeneric,
    ];

    #[test]
    fn test_descriptors_are_deterministic() {
        for archetype in ALL {
            let first = synthesize(archetype, REPO);
            let second = synthesize(archetype, REPO);
            assert_eq!(first.dockerfile.as_bytes(), second.dockerfile.as_bytes());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_every_descriptor_fetches_the_repository() {
        for archetype in ALL {
            let descriptor = synthesize(archetype, REPO);
            assert!(descriptor
                .dockerfile
                .starts_with("# Fetch sources\nFROM alpine/git:latest AS source\n"));
            assert!(descriptor
                .dockerfile
                .contains("git clone --depth 1 'https://github.com/acme/site' /src"));
            assert!(descriptor.dockerfile.contains("COPY --from=source /src"));
        }
    }

    #[test]
    fn test_exposed_ports() {
        for archetype in ALL {
            let descriptor = synthesize(archetype, REPO);
            assert_eq!(descriptor.internal_port, archetype.internal_port());
            assert!(descriptor
                .dockerfile
                .contains(&format!("EXPOSE {}\n", descriptor.internal_port)));
        }
    }

    #[test]
    fn test_static_discovery_order() {
        let dockerfile = synthesize(Archetype::Static, REPO).dockerfile;

        assert!(dockerfile.contains("for dir in . public docs dist build; do"));
        assert!(dockerfile.contains("find /src -type f -name '*.html' | sort | head -n 1"));
        assert!(dockerfile.contains("export LC_ALL=C"));
        assert!(dockerfile.contains("'<h1>Deployed from https://github.com/acme/site</h1>'"));
        assert!(dockerfile.contains("-name '*.css' -o -name '*.js'"));
        assert!(dockerfile.contains("FROM nginx:alpine"));
    }

    #[test]
    fn test_react_is_served_on_3000() {
        let dockerfile = synthesize(Archetype::React, REPO).dockerfile;
        assert!(dockerfile.contains("RUN npm run build"));
        assert!(dockerfile.contains(r#"CMD ["serve", "-s", "site", "-l", "3000"]"#));
    }

    #[test]
    fn test_different_repositories_differ() {
        let a = synthesize(Archetype::NodeGeneric, REPO);
        let b = synthesize(Archetype::NodeGeneric, "https://github.com/acme/other");
        assert_ne!(a.dockerfile, b.dockerfile);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(html_escape("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");

        let dockerfile = synthesize(Archetype::Static, "https://github.com/acme/o'brien").dockerfile;
        assert!(dockerfile.contains(r"'https://github.com/acme/o'\''brien'"));
        assert!(dockerfile.contains("o&#39;brien"));
    }
}
